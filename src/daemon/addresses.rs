//! Where a peer can be reached.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr},
};

use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

use crate::daemon::error::DaemonError;

/// Resolves a peer identifier into the addresses it is reachable at.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn resolve(&self, peer: PeerId) -> Result<PeerAddressSet, DaemonError>;
}

/// Known addresses of one peer, in the order they were learned.
///
/// Every address carries the `/p2p/<peer>` suffix. The IP of an address is
/// listed in [PeerAddressSet::ips] once, however many transports or ports
/// share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddressSet {
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    ips: Vec<IpAddr>,
}

impl PeerAddressSet {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            addrs: Vec::new(),
            ips: Vec::new(),
        }
    }

    pub fn from_addrs(peer: PeerId, addrs: impl IntoIterator<Item = Multiaddr>) -> Self {
        let mut set = Self::new(peer);
        for addr in addrs {
            set.insert(addr);
        }
        set
    }

    /// Adds `addr`, returning `false` if it was already known or belongs to
    /// another peer.
    pub fn insert(&mut self, addr: Multiaddr) -> bool {
        let Ok(addr) = addr.with_p2p(self.peer) else {
            return false;
        };
        if self.addrs.contains(&addr) {
            return false;
        }
        if let Some(ip) = routable_ip(&addr) {
            if !self.ips.contains(&ip) {
                self.ips.push(ip);
            }
        }
        self.addrs.push(addr);
        true
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn addrs(&self) -> &[Multiaddr] {
        &self.addrs
    }

    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// The distinct public IPv4 addresses of the peer.
    pub fn public_ipv4(&self) -> Vec<Ipv4Addr> {
        self.ips
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(ip) if is_public_ipv4(*ip) => Some(*ip),
                _ => None,
            })
            .collect()
    }
}

/// Bounded memory of where peers were seen.
///
/// Each peer keeps its most recent addresses. Past the peer capacity, the
/// least recently seen peer that is not pinned makes room for the new one.
#[derive(Debug)]
pub struct AddressBook {
    max_peers: usize,
    max_addresses_per_peer: usize,
    clock: u64,
    entries: HashMap<PeerId, BookEntry>,
}

#[derive(Debug)]
struct BookEntry {
    addrs: VecDeque<Multiaddr>,
    last_seen: u64,
}

impl AddressBook {
    pub fn new(max_peers: usize, max_addresses_per_peer: usize) -> Self {
        Self {
            max_peers,
            max_addresses_per_peer,
            clock: 0,
            entries: HashMap::new(),
        }
    }

    /// Records `addr` for `peer`. Peers for which `pinned` holds are never
    /// forgotten to make room, so the book only outgrows its capacity when
    /// every known peer is pinned.
    pub fn insert(&mut self, peer: PeerId, addr: Multiaddr, pinned: impl Fn(&PeerId) -> bool) {
        let Ok(addr) = addr.with_p2p(peer) else {
            return;
        };
        if !self.entries.contains_key(&peer) && self.entries.len() >= self.max_peers {
            self.evict_stalest(&pinned);
        }
        self.clock += 1;
        let entry = self.entries.entry(peer).or_insert_with(|| BookEntry {
            addrs: VecDeque::new(),
            last_seen: 0,
        });
        entry.last_seen = self.clock;
        if entry.addrs.contains(&addr) {
            return;
        }
        if entry.addrs.len() >= self.max_addresses_per_peer {
            entry.addrs.pop_front();
        }
        entry.addrs.push_back(addr);
    }

    fn evict_stalest(&mut self, pinned: &impl Fn(&PeerId) -> bool) {
        let stalest = self
            .entries
            .iter()
            .filter(|(peer, _)| !pinned(*peer))
            .min_by_key(|(_, entry)| entry.last_seen)
            .map(|(peer, _)| *peer);
        if let Some(peer) = stalest {
            self.entries.remove(&peer);
        }
    }

    pub fn addrs(&self, peer: &PeerId) -> impl Iterator<Item = &Multiaddr> {
        self.entries
            .get(peer)
            .into_iter()
            .flat_map(|entry| entry.addrs.iter())
    }

    /// Returns whether the peer was known.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        self.entries.remove(peer).is_some()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The IP component of `addr`, if it has one.
pub fn routable_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

pub fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    // 100.64.0.0/10 is carrier-grade NAT space.
    let shared = a == 100 && (64..128).contains(&b);
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || shared
        || a == 0
        || a >= 240)
}

/// Whether `addr` is worth announcing to the rest of the network.
pub fn is_public_addr(addr: &Multiaddr) -> bool {
    match routable_ip(addr) {
        Some(IpAddr::V4(ip)) => is_public_ipv4(ip),
        Some(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            // Global unicast only.
            (0x2000..0x4000).contains(&first)
        }
        None => true,
    }
}

/// Splits a trailing `/p2p/<peer>` off `addr`.
pub fn split_peer(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut addr = addr.clone();
    match addr.pop() {
        Some(Protocol::P2p(peer)) => Some((peer, addr)),
        _ => None,
    }
}
