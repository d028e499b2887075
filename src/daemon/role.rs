//! What a node does with the packets its tunnels deliver.

use std::{fmt, str::FromStr, sync::Arc};

use libp2p::PeerId;
use tracing::{debug, warn};

use crate::daemon::{
    actors::Addr,
    error::DaemonError,
    interface::InterfaceBridge,
    packet::{Ipv4Summary, Packet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoleKind {
    Host,
    #[default]
    Client,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Client => f.write_str("client"),
        }
    }
}

impl FromStr for RoleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "client" => Ok(Self::Client),
            other => Err(format!("unknown role `{other}`, expected `host` or `client`")),
        }
    }
}

/// Ingress policy of every tunnel stream on this node.
pub enum Role {
    /// Delivers tunnel traffic onto the local interface and feeds the
    /// interface's traffic back into the tunnel.
    Host(HostRole),
    /// Hands tunnel traffic to a packet sink.
    Client(ClientRole),
}

impl Role {
    pub fn host(bridge: Arc<InterfaceBridge>) -> Self {
        Self::Host(HostRole { bridge })
    }

    pub fn client(sink: Addr<Packet>) -> Self {
        Self::Client(ClientRole { sink })
    }

    pub fn kind(&self) -> RoleKind {
        match self {
            Self::Host(_) => RoleKind::Host,
            Self::Client(_) => RoleKind::Client,
        }
    }

    /// The interface whose packets are sent out on tunnel streams, if any.
    pub fn egress_source(&self) -> Option<&InterfaceBridge> {
        match self {
            Self::Host(host) => Some(&host.bridge),
            Self::Client(_) => None,
        }
    }

    /// Handles one packet received from `peer`. An error ends the ingress
    /// loop of the stream it came from.
    pub async fn deliver(&self, peer: PeerId, packet: Arc<[u8]>) -> Result<(), DaemonError> {
        match self {
            Self::Host(host) => host.deliver(peer, packet).await,
            Self::Client(client) => {
                client.deliver(packet).await;
                Ok(())
            }
        }
    }
}

pub struct HostRole {
    bridge: Arc<InterfaceBridge>,
}

impl HostRole {
    async fn deliver(&self, peer: PeerId, packet: Arc<[u8]>) -> Result<(), DaemonError> {
        self.bridge.create().await?;
        match Ipv4Summary::parse(&packet) {
            Some(summary) => debug!(
                %peer,
                protocol = summary.protocol_name(),
                source = %summary.source,
                destination = %summary.destination,
                size = packet.len(),
                "packet from tunnel"
            ),
            None => debug!(%peer, size = packet.len(), "non-IPv4 packet from tunnel"),
        }
        if let Err(error) = self.bridge.write(&packet).await {
            warn!(%peer, %error, "dropping packet the interface refused");
        }
        Ok(())
    }
}

pub struct ClientRole {
    sink: Addr<Packet>,
}

impl ClientRole {
    async fn deliver(&self, packet: Arc<[u8]>) {
        self.sink.send_message(Packet::Incoming(packet)).await;
    }
}
