//! Connection governor.
//!
//! Keeps the number of live connections between a low and a high watermark.
//! A connection is idle when its peer has no open tunnel stream and nothing
//! happened on it for the grace period. Idle connections are the only ones
//! ever evicted.

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    fmt,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use libp2p::{
    core::{transport::PortUse, Endpoint},
    swarm::{
        dummy, CloseConnection, ConnectionClosed, ConnectionDenied, ConnectionId,
        ConnectionEstablished, FromSwarm, NetworkBehaviour, THandler, THandlerInEvent,
        THandlerOutEvent, ToSwarm,
    },
    Multiaddr, PeerId,
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Watermarks and grace period of the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub grace_period: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            low_watermark: 100,
            high_watermark: 8000,
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Outcome of asking the governor to admit one more connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Admit once the given idle connection is closed. The governor already
    /// stopped counting it.
    AdmitAfterEvicting(PeerId, ConnectionId),
    Throttle,
}

#[derive(Debug)]
struct TrackedConnection {
    peer: PeerId,
    opened_at: Instant,
}

#[derive(Debug)]
struct PeerActivity {
    open_streams: usize,
    last_active: Instant,
}

#[derive(Debug)]
pub struct ConnectionGovernor {
    config: GovernorConfig,
    connections: HashMap<ConnectionId, TrackedConnection>,
    peers: HashMap<PeerId, PeerActivity>,
}

pub type SharedGovernor = Arc<Mutex<ConnectionGovernor>>;

impl ConnectionGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    pub fn shared(config: GovernorConfig) -> SharedGovernor {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> GovernorConfig {
        self.config
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Whether [ConnectionGovernor::admit] would let one more connection in,
    /// without evicting anything yet.
    pub fn would_admit(&self, now: Instant) -> bool {
        self.connections.len() < self.config.high_watermark || self.oldest_idle(now).is_some()
    }

    /// Decides whether one more connection may be established.
    pub fn admit(&mut self, now: Instant) -> Admission {
        if self.connections.len() < self.config.low_watermark {
            return Admission::Admit;
        }
        if let Some(connection_id) = self.oldest_idle(now) {
            if let Some(connection) = self.connections.remove(&connection_id) {
                self.forget_if_unused(connection.peer);
                return Admission::AdmitAfterEvicting(connection.peer, connection_id);
            }
        }
        if self.connections.len() >= self.config.high_watermark {
            return Admission::Throttle;
        }
        Admission::Admit
    }

    pub fn insert(&mut self, connection_id: ConnectionId, peer: PeerId, now: Instant) {
        self.connections.insert(
            connection_id,
            TrackedConnection {
                peer,
                opened_at: now,
            },
        );
        self.peers.entry(peer).or_insert(PeerActivity {
            open_streams: 0,
            last_active: now,
        });
    }

    pub fn remove(&mut self, connection_id: ConnectionId) {
        if let Some(connection) = self.connections.remove(&connection_id) {
            self.forget_if_unused(connection.peer);
        }
    }

    pub fn stream_opened(&mut self, peer: PeerId, now: Instant) {
        let activity = self.peers.entry(peer).or_insert(PeerActivity {
            open_streams: 0,
            last_active: now,
        });
        activity.open_streams += 1;
        activity.last_active = now;
    }

    pub fn stream_closed(&mut self, peer: PeerId, now: Instant) {
        if let Some(activity) = self.peers.get_mut(&peer) {
            activity.open_streams = activity.open_streams.saturating_sub(1);
            activity.last_active = now;
        }
        self.forget_if_unused(peer);
    }

    pub fn is_idle(&self, connection_id: ConnectionId, now: Instant) -> bool {
        self.connections
            .get(&connection_id)
            .is_some_and(|connection| self.connection_idle(connection, now))
    }

    /// Evicts idle connections, oldest first, until the count is back at the
    /// low watermark or no idle connection is left.
    pub fn trim(&mut self, now: Instant) -> Vec<(PeerId, ConnectionId)> {
        let mut evicted = Vec::new();
        while self.connections.len() > self.config.low_watermark {
            let Some(connection_id) = self.oldest_idle(now) else {
                break;
            };
            if let Some(connection) = self.connections.remove(&connection_id) {
                self.forget_if_unused(connection.peer);
                evicted.push((connection.peer, connection_id));
            }
        }
        evicted
    }

    /// Drops the activity of a peer with no tracked connection and no open
    /// stream.
    fn forget_if_unused(&mut self, peer: PeerId) {
        let connected = self.connections.values().any(|connection| connection.peer == peer);
        let unused = self
            .peers
            .get(&peer)
            .is_some_and(|activity| activity.open_streams == 0);
        if !connected && unused {
            self.peers.remove(&peer);
        }
    }

    fn connection_idle(&self, connection: &TrackedConnection, now: Instant) -> bool {
        let last_active = match self.peers.get(&connection.peer) {
            Some(activity) if activity.open_streams > 0 => return false,
            Some(activity) => activity.last_active.max(connection.opened_at),
            None => connection.opened_at,
        };
        now.saturating_duration_since(last_active) >= self.config.grace_period
    }

    fn oldest_idle(&self, now: Instant) -> Option<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, connection)| self.connection_idle(connection, now))
            .min_by_key(|(_, connection)| connection.opened_at)
            .map(|(connection_id, _)| *connection_id)
    }
}

#[derive(Debug)]
struct Throttled {
    high_watermark: usize,
}

impl fmt::Display for Throttled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection count at high watermark ({}) with no idle connection to evict",
            self.high_watermark
        )
    }
}

impl std::error::Error for Throttled {}

/// Attaches a [ConnectionGovernor] to the swarm.
///
/// New connections are denied when the governor would throttle them. The
/// eviction that makes room is only chosen once every behaviour has accepted
/// the connection. Evictions and periodic trims become close requests.
pub struct GovernorBehaviour {
    governor: SharedGovernor,
    evictions: VecDeque<(PeerId, ConnectionId)>,
    trim_interval: tokio::time::Interval,
}

impl GovernorBehaviour {
    pub fn new(governor: SharedGovernor, trim_period: Duration) -> Self {
        let mut trim_interval = tokio::time::interval(trim_period);
        trim_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            governor,
            evictions: VecDeque::new(),
            trim_interval,
        }
    }

    fn check(&self, peer: PeerId) -> Result<THandler<Self>, ConnectionDenied> {
        let governor = self.governor.lock();
        if governor.would_admit(Instant::now()) {
            return Ok(dummy::ConnectionHandler);
        }
        debug!(%peer, "throttling connection");
        Err(ConnectionDenied::new(Throttled {
            high_watermark: governor.config().high_watermark,
        }))
    }

    fn settle(&mut self, peer: PeerId, connection_id: ConnectionId) {
        let now = Instant::now();
        let mut governor = self.governor.lock();
        match governor.admit(now) {
            Admission::Admit => {}
            Admission::AdmitAfterEvicting(victim, victim_connection) => {
                debug!(%victim, connection_id = ?victim_connection, new_peer = %peer, "evicting idle connection");
                self.evictions.push_back((victim, victim_connection));
            }
            Admission::Throttle => {
                // Filled up since the connection was checked.
                debug!(%peer, "closing connection above the high watermark");
                self.evictions.push_back((peer, connection_id));
                return;
            }
        }
        governor.insert(connection_id, peer, now);
    }
}

impl NetworkBehaviour for GovernorBehaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        _remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        self.check(peer)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        self.check(peer)
    }

    fn on_swarm_event(&mut self, event: FromSwarm) {
        match event {
            FromSwarm::ConnectionEstablished(ConnectionEstablished {
                peer_id,
                connection_id,
                ..
            }) => self.settle(peer_id, connection_id),
            FromSwarm::ConnectionClosed(ConnectionClosed { connection_id, .. }) => {
                self.governor.lock().remove(connection_id);
            }
            _ => {}
        }
    }

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        while self.trim_interval.poll_tick(cx).is_ready() {
            let trimmed = self.governor.lock().trim(Instant::now());
            if !trimmed.is_empty() {
                info!(count = trimmed.len(), "trimming idle connections");
            }
            self.evictions.extend(trimmed);
        }
        if let Some((peer_id, connection_id)) = self.evictions.pop_front() {
            return Poll::Ready(ToSwarm::CloseConnection {
                peer_id,
                connection: CloseConnection::One(connection_id),
            });
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use futures::task::noop_waker_ref;
    use libp2p::core::ConnectedPoint;

    use super::*;

    fn config(low: usize, high: usize) -> GovernorConfig {
        GovernorConfig {
            low_watermark: low,
            high_watermark: high,
            grace_period: Duration::from_secs(60),
        }
    }

    fn fill(governor: &mut ConnectionGovernor, count: usize, at: Instant) -> Vec<PeerId> {
        (0..count)
            .map(|i| {
                let peer = PeerId::random();
                governor.insert(ConnectionId::new_unchecked(i), peer, at);
                peer
            })
            .collect()
    }

    #[test]
    fn admits_below_low_watermark_without_eviction() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(3, 5));
        fill(&mut governor, 2, start);
        let later = start + Duration::from_secs(600);
        assert_eq!(governor.admit(later), Admission::Admit);
        assert_eq!(governor.len(), 2);
    }

    #[test]
    fn evicts_exactly_one_idle_connection_above_low_watermark() {
        let (low, high) = (2, 4);
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(low, high));
        for i in 0..=low {
            let opened = start + Duration::from_secs(i as u64);
            governor.insert(ConnectionId::new_unchecked(i), PeerId::random(), opened);
        }

        let now = start + Duration::from_secs(120);
        let Admission::AdmitAfterEvicting(_, victim) = governor.admit(now) else {
            panic!("expected an eviction");
        };
        assert_eq!(victim, ConnectionId::new_unchecked(0));
        assert_eq!(governor.len(), low);

        governor.insert(ConnectionId::new_unchecked(100), PeerId::random(), now);
        assert_eq!(governor.len(), low + 1);
        assert!(governor.len() <= high);
    }

    #[test]
    fn connections_within_grace_period_are_not_idle() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(1, 3));
        fill(&mut governor, 2, start);
        let now = start + Duration::from_secs(10);
        assert!(!governor.is_idle(ConnectionId::new_unchecked(0), now));
        assert_eq!(governor.admit(now), Admission::Admit);
    }

    #[test]
    fn throttles_at_high_watermark_without_idle_candidates() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(1, 2));
        let peers = fill(&mut governor, 2, start);
        for peer in &peers {
            governor.stream_opened(*peer, start);
        }
        let later = start + Duration::from_secs(600);
        assert_eq!(governor.admit(later), Admission::Throttle);
        assert_eq!(governor.len(), 2);
    }

    #[test]
    fn closing_a_stream_restarts_the_grace_period() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(0, 10));
        let peers = fill(&mut governor, 1, start);
        governor.stream_opened(peers[0], start);
        let closed_at = start + Duration::from_secs(100);
        governor.stream_closed(peers[0], closed_at);

        let id = ConnectionId::new_unchecked(0);
        assert!(!governor.is_idle(id, closed_at + Duration::from_secs(30)));
        assert!(governor.is_idle(id, closed_at + Duration::from_secs(60)));
    }

    #[test]
    fn trim_reclaims_idle_connections_down_to_low_watermark() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(2, 10));
        let peers = fill(&mut governor, 5, start);
        governor.stream_opened(peers[0], start);

        let evicted = governor.trim(start + Duration::from_secs(61));
        assert_eq!(evicted.len(), 3);
        assert_eq!(governor.len(), 2);
        assert!(governor.contains(ConnectionId::new_unchecked(0)));
        assert!(evicted.iter().all(|(peer, _)| *peer != peers[0]));
        assert_eq!(governor.peers.len(), 2);
    }

    #[test]
    fn trim_keeps_everything_below_low_watermark() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(5, 10));
        fill(&mut governor, 3, start);
        assert!(governor.trim(start + Duration::from_secs(3600)).is_empty());
        assert_eq!(governor.len(), 3);
    }

    #[test]
    fn removing_last_connection_forgets_idle_peer() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(1, 2));
        fill(&mut governor, 1, start);
        governor.remove(ConnectionId::new_unchecked(0));
        assert!(governor.is_empty());
        assert!(governor.peers.is_empty());
    }

    #[test]
    fn evicted_peer_is_forgotten() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(1, 4));
        fill(&mut governor, 1, start);
        let Admission::AdmitAfterEvicting(_, victim) = governor.admit(start + Duration::from_secs(120))
        else {
            panic!("expected an eviction");
        };
        // The victim's close arrives after the governor stopped tracking it.
        governor.remove(victim);
        assert!(governor.is_empty());
        assert!(governor.peers.is_empty());
    }

    #[test]
    fn peer_is_forgotten_when_its_last_stream_closes() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(1, 4));
        let peers = fill(&mut governor, 1, start);
        governor.stream_opened(peers[0], start);
        governor.stream_opened(peers[0], start);
        governor.remove(ConnectionId::new_unchecked(0));
        assert_eq!(governor.peers.len(), 1);

        governor.stream_closed(peers[0], start);
        assert_eq!(governor.peers.len(), 1);
        governor.stream_closed(peers[0], start);
        assert!(governor.peers.is_empty());
    }

    #[test]
    fn closed_stream_keeps_connected_peer() {
        let start = Instant::now();
        let mut governor = ConnectionGovernor::new(config(1, 4));
        let peers = fill(&mut governor, 1, start);
        governor.stream_opened(peers[0], start);
        governor.stream_closed(peers[0], start);
        assert!(governor.peers.contains_key(&peers[0]));
    }

    fn behaviour(config: GovernorConfig) -> (GovernorBehaviour, SharedGovernor) {
        let governor = ConnectionGovernor::shared(config);
        let behaviour = GovernorBehaviour::new(governor.clone(), Duration::from_secs(3600));
        (behaviour, governor)
    }

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/4002".parse().unwrap()
    }

    fn establish(behaviour: &mut GovernorBehaviour, peer_id: PeerId, connection_id: ConnectionId) {
        let endpoint = ConnectedPoint::Listener {
            local_addr: addr(),
            send_back_addr: addr(),
        };
        behaviour.on_swarm_event(FromSwarm::ConnectionEstablished(ConnectionEstablished {
            peer_id,
            connection_id,
            endpoint: &endpoint,
            failed_addresses: &[],
            other_established: 0,
        }));
    }

    fn next_close(behaviour: &mut GovernorBehaviour) -> Option<(PeerId, ConnectionId)> {
        let mut cx = Context::from_waker(noop_waker_ref());
        match behaviour.poll(&mut cx) {
            Poll::Ready(ToSwarm::CloseConnection {
                peer_id,
                connection: CloseConnection::One(connection_id),
            }) => Some((peer_id, connection_id)),
            Poll::Ready(_) => panic!("unexpected swarm command"),
            Poll::Pending => None,
        }
    }

    #[tokio::test]
    async fn eviction_is_chosen_once_the_connection_is_established() {
        let (mut behaviour, governor) = behaviour(GovernorConfig {
            low_watermark: 1,
            high_watermark: 4,
            grace_period: Duration::ZERO,
        });
        let old_peer = PeerId::random();
        establish(&mut behaviour, old_peer, ConnectionId::new_unchecked(0));
        assert_eq!(next_close(&mut behaviour), None);

        let new_peer = PeerId::random();
        let new_connection = ConnectionId::new_unchecked(1);
        assert!(behaviour
            .handle_established_inbound_connection(new_connection, new_peer, &addr(), &addr())
            .is_ok());
        // Another behaviour may still deny it, so nothing is evicted yet.
        assert_eq!(next_close(&mut behaviour), None);
        assert!(governor.lock().contains(ConnectionId::new_unchecked(0)));

        establish(&mut behaviour, new_peer, new_connection);
        assert_eq!(
            next_close(&mut behaviour),
            Some((old_peer, ConnectionId::new_unchecked(0)))
        );
        assert_eq!(next_close(&mut behaviour), None);
        let governor = governor.lock();
        assert_eq!(governor.len(), 1);
        assert!(governor.contains(new_connection));
    }

    #[tokio::test]
    async fn throttled_connection_is_denied() {
        let (mut behaviour, governor) = behaviour(config(1, 1));
        let busy_peer = PeerId::random();
        establish(&mut behaviour, busy_peer, ConnectionId::new_unchecked(0));
        governor.lock().stream_opened(busy_peer, Instant::now());

        let denied = behaviour.handle_established_outbound_connection(
            ConnectionId::new_unchecked(1),
            PeerId::random(),
            &addr(),
            Endpoint::Dialer,
            PortUse::Reuse,
        );
        match denied {
            Err(denied) => assert!(denied.downcast::<Throttled>().is_ok()),
            Ok(_) => panic!("connection above the high watermark was admitted"),
        }
        assert_eq!(next_close(&mut behaviour), None);
        assert_eq!(governor.lock().len(), 1);
    }

    #[tokio::test]
    async fn trim_tick_closes_idle_connections() {
        let (mut behaviour, governor) = behaviour(GovernorConfig {
            low_watermark: 0,
            high_watermark: 4,
            grace_period: Duration::ZERO,
        });
        let peer = PeerId::random();
        governor
            .lock()
            .insert(ConnectionId::new_unchecked(0), peer, Instant::now());

        assert_eq!(
            next_close(&mut behaviour),
            Some((peer, ConnectionId::new_unchecked(0)))
        );
        assert!(governor.lock().is_empty());
        assert!(governor.lock().peers.is_empty());
    }
}
