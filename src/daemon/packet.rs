use std::{fmt::Debug, net::Ipv4Addr, sync::Arc};

use etherparse::Ipv4HeaderSlice;

#[derive(Clone)]
pub enum Packet {
    /// Received from a tunnel stream, headed for the local interface.
    Incoming(Arc<[u8]>),
}

impl Packet {
    pub fn content(&self) -> &[u8] {
        match self {
            Self::Incoming(content) => content,
        }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming(arg0) => f.debug_tuple("Incoming").field(&arg0.len()).finish(),
        }
    }
}

/// The parts of an IPv4 header that are worth logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Summary {
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Summary {
    /// Returns `None` for anything that is not a well-formed IPv4 header.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let header = Ipv4HeaderSlice::from_slice(packet).ok()?;
        Some(Self {
            protocol: header.protocol().0,
            source: header.source_addr(),
            destination: header.destination_addr(),
        })
    }

    pub fn protocol_name(&self) -> &'static str {
        protocol_name(self.protocol)
    }
}

/// IANA name of an IP protocol number, for the ones that show up in practice.
pub fn protocol_name(protocol: u8) -> &'static str {
    match protocol {
        1 => "ICMP",
        2 => "IGMP",
        4 => "IPv4",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "IPv6-ICMP",
        89 => "OSPF",
        132 => "SCTP",
        _ => "unknown",
    }
}
