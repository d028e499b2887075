//! Module for [Overlay] actor.
//!
//! It owns the libp2p swarm: transports, the discovery table, the connection
//! governor and the tunnel protocol handler. Everything else talks to the
//! network through its [Addr].

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    connection_limits::{self, ConnectionLimits},
    identify,
    identity::Keypair,
    kad::{self, store::MemoryStore, GetClosestPeersError, QueryId, QueryResult},
    memory_connection_limits, noise, ping,
    swarm::{dial_opts::DialOpts, DialError, NetworkBehaviour, SwarmEvent},
    tcp, tls, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder,
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::daemon::{
    addresses::{is_public_addr, split_peer, AddressBook, PeerAddressSet, PeerResolver},
    error::DaemonError,
    governor::{GovernorBehaviour, SharedGovernor},
};

use super::{Actor, Addr};

/// Protocol version announced through Identify.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/skypier/1.0";

/// Public rendezvous peers used to join the discovery network.
pub const BOOTSTRAP_ADDRESSES: [&str; 2] = [
    "/ip4/136.244.105.166/udp/4001/quic-v1/p2p/12D3KooWKzmZmLySs5WKBvdxzsctWNsN9abbtnj4PyyqNg9LCyek",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
];

/// How many addresses are remembered for one peer.
const MAX_ADDRESSES_PER_PEER: usize = 16;

/// How many peers the address book remembers.
const MAX_KNOWN_PEERS: usize = 4096;

pub fn default_bootstrap() -> Vec<Multiaddr> {
    BOOTSTRAP_ADDRESSES
        .iter()
        .filter_map(|addr| addr.parse().ok())
        .collect()
}

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Zero picks any free port.
    pub tcp_port: u16,
    pub udp_port: u16,
    pub advertise_private_addresses: bool,
    pub trim_interval: Duration,
    pub max_connections: u32,
    pub max_connections_per_peer: u32,
    /// Process memory above which new connections are refused.
    pub max_memory_bytes: usize,
    pub idle_connection_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            udp_port: 0,
            advertise_private_addresses: false,
            trim_interval: Duration::from_secs(10),
            max_connections: 8192,
            max_connections_per_peer: 8,
            max_memory_bytes: 1 << 30,
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

// Behaviours that can deny a connection come first.
#[derive(NetworkBehaviour)]
pub struct OverlayBehaviour {
    limits: connection_limits::Behaviour,
    memory: memory_connection_limits::Behaviour,
    governor: GovernorBehaviour,
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    stream: libp2p_stream::Behaviour,
}

impl OverlayBehaviour {
    fn new(key: &Keypair, config: &OverlayConfig, governor: SharedGovernor) -> Self {
        let peer_id = key.public().to_peer_id();

        let mut kad_config = kad::Config::new(kad::PROTOCOL_NAME);
        kad_config.set_query_timeout(Duration::from_secs(60));
        let kad = kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), key.public())
                .with_hide_listen_addrs(!config.advertise_private_addresses),
        );

        let limits = ConnectionLimits::default()
            .with_max_established(Some(config.max_connections))
            .with_max_established_per_peer(Some(config.max_connections_per_peer));

        Self {
            limits: connection_limits::Behaviour::new(limits),
            memory: memory_connection_limits::Behaviour::with_max_bytes(config.max_memory_bytes),
            governor: GovernorBehaviour::new(governor, config.trim_interval),
            kad,
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            stream: libp2p_stream::Behaviour::new(),
        }
    }
}

type ResolveReply = oneshot::Sender<Result<PeerAddressSet, DaemonError>>;

pub enum OverlayMessage {
    /// Connects to the given bootstrap peers, then bootstraps the discovery
    /// table. Replies with how many bootstrap peers were reached.
    Join(Vec<Multiaddr>, oneshot::Sender<Result<usize, DaemonError>>),
    /// Looks a peer up and connects to it.
    Resolve(PeerId, ResolveReply),
    /// Closes every connection to a peer. Replies whether it was connected.
    Disconnect(PeerId, oneshot::Sender<bool>),
    ListenAddresses(oneshot::Sender<Vec<Multiaddr>>),
}

struct PendingJoin {
    waiting: HashSet<PeerId>,
    connected: usize,
    reply: oneshot::Sender<Result<usize, DaemonError>>,
}

struct PendingLookup {
    peer: PeerId,
    replies: Vec<ResolveReply>,
}

pub struct Overlay {
    swarm: Swarm<OverlayBehaviour>,
    address: Addr<OverlayMessage>,
    receiver: mpsc::Receiver<OverlayMessage>,
    advertise_private_addresses: bool,
    address_book: AddressBook,
    pending_join: Option<PendingJoin>,
    lookups: HashMap<QueryId, PendingLookup>,
    dials: HashMap<PeerId, Vec<ResolveReply>>,
}

impl Overlay {
    /// Builds the swarm and starts listening on TCP and QUIC.
    pub fn new(
        keypair: Keypair,
        config: OverlayConfig,
        governor: SharedGovernor,
    ) -> Result<Self, DaemonError> {
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                (tls::Config::new, noise::Config::new),
                yamux::Config::default,
            )
            .map_err(|error| DaemonError::Transport(error.to_string()))?
            .with_quic()
            .with_dns()?
            .with_behaviour(|key| OverlayBehaviour::new(key, &config, governor.clone()))
            .map_err(|error| DaemonError::Transport(error.to_string()))?
            .with_swarm_config(|swarm_config| {
                swarm_config.with_idle_connection_timeout(config.idle_connection_timeout)
            })
            .build();

        let tcp: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.tcp_port).parse()?;
        let quic: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.udp_port).parse()?;
        for addr in [tcp, quic] {
            swarm
                .listen_on(addr)
                .map_err(|error| DaemonError::Transport(error.to_string()))?;
        }

        let (sender, receiver) = mpsc::channel(16);
        Ok(Self {
            swarm,
            address: Addr::new(sender),
            receiver,
            advertise_private_addresses: config.advertise_private_addresses,
            address_book: AddressBook::new(MAX_KNOWN_PEERS, MAX_ADDRESSES_PER_PEER),
            pending_join: None,
            lookups: HashMap::new(),
            dials: HashMap::new(),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// A handle for opening and accepting streams over this overlay.
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.swarm.behaviour().stream.new_control()
    }

    fn remember(&mut self, peer: PeerId, addr: Multiaddr) {
        if peer == *self.swarm.local_peer_id() {
            return;
        }
        let Self {
            swarm,
            address_book,
            pending_join,
            lookups,
            dials,
            ..
        } = self;
        // Peers we are connected to or about to reach keep their addresses.
        address_book.insert(peer, addr, |peer| {
            swarm.is_connected(peer)
                || dials.contains_key(peer)
                || lookups.values().any(|lookup| lookup.peer == *peer)
                || pending_join
                    .as_ref()
                    .is_some_and(|join| join.waiting.contains(peer))
        });
    }

    fn address_set(&self, peer: PeerId) -> PeerAddressSet {
        PeerAddressSet::from_addrs(peer, self.address_book.addrs(&peer).cloned())
    }

    fn join(&mut self, bootstrap: Vec<Multiaddr>, reply: oneshot::Sender<Result<usize, DaemonError>>) {
        let mut waiting = HashSet::new();
        for addr in bootstrap {
            let Some((peer, transport)) = split_peer(&addr) else {
                warn!(%addr, "bootstrap address has no peer id, skipping");
                continue;
            };
            self.swarm.behaviour_mut().kad.add_address(&peer, transport.clone());
            self.remember(peer, transport.clone());
            let dial = DialOpts::peer_id(peer).addresses(vec![transport]).build();
            match self.swarm.dial(dial) {
                Ok(()) => {
                    waiting.insert(peer);
                }
                Err(error) => warn!(%peer, %error, "cannot dial bootstrap peer"),
            }
        }
        self.pending_join = Some(PendingJoin {
            waiting,
            connected: 0,
            reply,
        });
        self.progress_join(None);
    }

    /// Records the outcome of a dial to `peer`, finishing the join once every
    /// bootstrap peer has answered.
    fn progress_join(&mut self, outcome: Option<(PeerId, bool)>) {
        let Some(pending) = self.pending_join.as_mut() else {
            return;
        };
        if let Some((peer, connected)) = outcome {
            if !pending.waiting.remove(&peer) {
                return;
            }
            if connected {
                pending.connected += 1;
            }
        }
        if !pending.waiting.is_empty() {
            return;
        }
        let Some(pending) = self.pending_join.take() else {
            return;
        };
        if let Err(error) = self.swarm.behaviour_mut().kad.bootstrap() {
            warn!(%error, "discovery table has no peers to bootstrap from");
        }
        info!(connected = pending.connected, "joined the overlay");
        let _ = pending.reply.send(Ok(pending.connected));
    }

    fn resolve(&mut self, peer: PeerId, reply: ResolveReply) {
        let known = self.address_set(peer);
        if self.swarm.is_connected(&peer) && !known.is_empty() {
            let _ = reply.send(Ok(known));
            return;
        }
        if let Some(lookup) = self.lookups.values_mut().find(|lookup| lookup.peer == peer) {
            lookup.replies.push(reply);
            return;
        }
        debug!(%peer, "looking peer up");
        let query = self.swarm.behaviour_mut().kad.get_closest_peers(peer);
        self.lookups.insert(
            query,
            PendingLookup {
                peer,
                replies: vec![reply],
            },
        );
    }

    /// Connects to a looked-up peer, answering once the dial has settled.
    fn finish_lookup(&mut self, lookup: PendingLookup) {
        let PendingLookup { peer, replies } = lookup;
        let known = self.address_set(peer);
        if known.is_empty() {
            warn!(%peer, "peer not found");
            for reply in replies {
                let _ = reply.send(Err(DaemonError::PeerNotFound(peer)));
            }
            return;
        }
        if self.swarm.is_connected(&peer) {
            Self::answer(replies, &known);
            return;
        }

        let dial = DialOpts::peer_id(peer)
            .addresses(known.addrs().to_vec())
            .build();
        match self.swarm.dial(dial) {
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.dials.entry(peer).or_default().extend(replies);
            }
            Err(error) => {
                warn!(%peer, %error, "cannot dial resolved peer");
                Self::answer(replies, &known);
            }
        }
    }

    fn answer(replies: Vec<ResolveReply>, known: &PeerAddressSet) {
        for reply in replies {
            let _ = reply.send(Ok(known.clone()));
        }
    }

    fn settle_dials(&mut self, peer: PeerId) {
        if let Some(replies) = self.dials.remove(&peer) {
            Self::answer(replies, &self.address_set(peer));
        }
    }

    fn handle_message(&mut self, message: OverlayMessage) {
        match message {
            OverlayMessage::Join(bootstrap, reply) => self.join(bootstrap, reply),
            OverlayMessage::Resolve(peer, reply) => self.resolve(peer, reply),
            OverlayMessage::Disconnect(peer, reply) => {
                let connected = self.swarm.disconnect_peer_id(peer).is_ok();
                if connected {
                    info!(%peer, "disconnecting");
                }
                let _ = reply.send(connected);
            }
            OverlayMessage::ListenAddresses(reply) => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer,
                addresses,
                old_peer,
                ..
            } => {
                for addr in addresses.iter() {
                    self.remember(peer, addr.clone());
                }
                if let Some(old_peer) = old_peer {
                    if !self.swarm.is_connected(&old_peer) && self.address_book.forget(&old_peer) {
                        debug!(peer = %old_peer, "forgot peer dropped from the discovery table");
                    }
                }
            }
            kad::Event::OutboundQueryProgressed {
                id,
                result: QueryResult::GetClosestPeers(result),
                step,
                ..
            } => {
                let peers = match result {
                    Ok(ok) => ok.peers,
                    Err(GetClosestPeersError::Timeout { peers, .. }) => {
                        debug!("peer lookup timed out");
                        peers
                    }
                };
                for info in peers {
                    for addr in info.addrs {
                        self.remember(info.peer_id, addr);
                    }
                }
                if step.last {
                    if let Some(lookup) = self.lookups.remove(&id) {
                        self.finish_lookup(lookup);
                    }
                }
            }
            kad::Event::OutboundQueryProgressed {
                result: QueryResult::Bootstrap(result),
                ..
            } => match result {
                Ok(ok) => debug!(remaining = ok.num_remaining, "bootstrap step done"),
                Err(error) => debug!(%error, "bootstrap step failed"),
            },
            _ => {}
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<OverlayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(
                    peer_id = %self.swarm.local_peer_id(),
                    %address,
                    "listening"
                );
                if self.advertise_private_addresses || is_public_addr(&address) {
                    self.swarm.add_external_address(address);
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(peer = %peer_id, address = %endpoint.get_remote_address(), "connected");
                if endpoint.is_dialer() {
                    self.remember(peer_id, endpoint.get_remote_address().clone());
                }
                self.progress_join(Some((peer_id, true)));
                self.settle_dials(peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, cause = ?cause, "connection closed");
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if self.swarm.is_connected(&peer_id) {
                    return;
                }
                warn!(peer = %peer_id, %error, "connection attempt failed");
                self.progress_join(Some((peer_id, false)));
                self.settle_dials(peer_id);
            }
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Kad(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                    self.remember(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(OverlayBehaviourEvent::Ping(ping::Event {
                peer,
                result: Ok(rtt),
                ..
            })) => {
                debug!(%peer, ?rtt, "ping");
            }
            _ => {}
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                Some(message) = self.receiver.recv() => self.handle_message(message),
            }
        }
    }
}

impl Actor<OverlayMessage> for Overlay {
    fn get_addr(&self) -> Addr<OverlayMessage> {
        self.address.clone()
    }
}

#[async_trait]
impl PeerResolver for Addr<OverlayMessage> {
    async fn resolve(&self, peer: PeerId) -> Result<PeerAddressSet, DaemonError> {
        self.request(|reply| OverlayMessage::Resolve(peer, reply))
            .await?
    }
}
