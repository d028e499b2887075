//! Module for [PacketLogger] actor.
//!
//! It is the sink for tunnel packets a node has no other use for: they are
//! logged and dropped.

use tokio::sync::mpsc;
use tracing::debug;

use crate::daemon::packet::{Ipv4Summary, Packet};

use super::{Actor, Addr};

/// Represents a packet logger actor responsible for logging all packets.
pub struct PacketLogger {
    /// The address used to send packets to this logger.
    address: Addr<Packet>,

    /// The receiver channel for incoming packets.
    receiver: mpsc::Receiver<Packet>,
}

impl PacketLogger {
    /// Creates a new [PacketLogger] instance.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let address = Addr::new(sender);
        Self { address, receiver }
    }

    /// Runs the packet logger until every [Addr] to it is gone.
    pub async fn run(mut self) {
        // Keeping our own address would hold the channel open forever.
        drop(self.address);
        let mut dropped: u64 = 0;
        while let Some(packet) = self.receiver.recv().await {
            dropped += 1;
            match Ipv4Summary::parse(packet.content()) {
                Some(summary) => debug!(
                    ?packet,
                    protocol = summary.protocol_name(),
                    source = %summary.source,
                    destination = %summary.destination,
                    dropped,
                    "dropping packet"
                ),
                None => debug!(?packet, dropped, "dropping packet"),
            }
        }
    }
}

impl Default for PacketLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Actor<Packet> for PacketLogger {
    fn get_addr(&self) -> Addr<Packet> {
        self.address.clone()
    }
}
