//! The skypier daemon. It is responsible for most of the program's functionality.

pub mod actors;
pub mod addresses;
pub mod config;
pub mod error;
pub mod frame;
pub mod governor;
pub mod identity;
pub mod interface;
pub mod limits;
pub mod packet;
pub mod role;
pub mod routes;

use std::{
    net::{Ipv4Addr, TcpListener, UdpSocket},
    ops::RangeInclusive,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use libp2p::Multiaddr;
use tokio::{select, task::JoinSet};
use tracing::{error, info, warn};

use crate::{
    common::DEFAULT_API_PORT,
    daemon::{
        actors::{
            daemon_controller::{ControlContext, DaemonController, FullTunnel},
            overlay::{default_bootstrap, Overlay, OverlayConfig, OverlayMessage},
            packet_logger::PacketLogger,
            peer_collection::PeerCollection,
            tunnel::Tunnel,
            Actor,
        },
        config::{NodeConfig, DEFAULT_CONFIG_PATH},
        error::DaemonError,
        governor::{ConnectionGovernor, GovernorConfig},
        identity::NodeIdentity,
        interface::{InterfaceBridge, InterfaceConfig},
        limits::{StreamLimiter, StreamLimits},
        role::{Role, RoleKind},
        routes::{IpRouteTable, RouteManager},
    },
};

/// Ports tried, in order, when no listen port is given.
pub const LISTEN_PORTS: RangeInclusive<u16> = 4002..=4999;

/// The skypier daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    pub role: RoleKind,
    pub api_port: u16,
    /// First free port of [LISTEN_PORTS] when unset.
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub bootstrap: Vec<Multiaddr>,
    pub governor: GovernorConfig,
    pub trim_interval: Duration,
    pub stream_limits: StreamLimits,
    pub max_connections: u32,
    pub max_connections_per_peer: u32,
    pub max_memory_bytes: usize,
    pub interface: InterfaceConfig,
    /// Gateway on the tunnel interface that all traffic is routed to after a
    /// successful connect. No full tunnel when unset.
    pub full_tunnel_gateway: Option<Ipv4Addr>,
    /// Bound on joining the overlay at startup.
    pub init_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let overlay = OverlayConfig::default();
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            role: RoleKind::default(),
            api_port: DEFAULT_API_PORT,
            tcp_port: None,
            udp_port: None,
            bootstrap: default_bootstrap(),
            governor: GovernorConfig::default(),
            trim_interval: overlay.trim_interval,
            stream_limits: StreamLimits::default(),
            max_connections: overlay.max_connections,
            max_connections_per_peer: overlay.max_connections_per_peer,
            max_memory_bytes: overlay.max_memory_bytes,
            interface: InterfaceConfig::default(),
            full_tunnel_gateway: None,
            init_timeout: Duration::from_secs(30),
        }
    }
}

/// First port of `ports` that a TCP listener can bind on all interfaces.
pub fn first_free_tcp_port(ports: RangeInclusive<u16>) -> Result<u16, DaemonError> {
    ports
        .into_iter()
        .find(|port| TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port)).is_ok())
        .ok_or_else(|| no_free_port("TCP"))
}

/// First port of `ports` that a UDP socket can bind on all interfaces.
pub fn first_free_udp_port(ports: RangeInclusive<u16>) -> Result<u16, DaemonError> {
    ports
        .into_iter()
        .find(|port| UdpSocket::bind((Ipv4Addr::UNSPECIFIED, *port)).is_ok())
        .ok_or_else(|| no_free_port("UDP"))
}

fn no_free_port(transport: &str) -> DaemonError {
    DaemonError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free {} port in {:?}", transport, LISTEN_PORTS),
    ))
}

/// Loads the node configuration and identity, saving a freshly generated key.
fn load_identity(config: &DaemonConfig) -> Result<(NodeConfig, NodeIdentity), DaemonError> {
    NodeConfig::init(&config.config_path)?;
    let mut node_config = NodeConfig::load(&config.config_path)?;
    let identity = NodeIdentity::load_or_generate(&mut node_config)?;
    if identity.is_generated() {
        node_config.save(&config.config_path)?;
    }
    Ok((node_config, identity))
}

/// The skypier daemon
pub async fn run_daemon(config: DaemonConfig) -> Result<(), DaemonError> {
    let (node_config, identity) = load_identity(&config)?;
    info!(peer_id = %identity.peer_id(), role = %config.role, "starting skypier node");

    let overlay_config = OverlayConfig {
        tcp_port: config.tcp_port.map_or_else(|| first_free_tcp_port(LISTEN_PORTS), Ok)?,
        udp_port: config.udp_port.map_or_else(|| first_free_udp_port(LISTEN_PORTS), Ok)?,
        advertise_private_addresses: node_config.advertise_private_addresses,
        trim_interval: config.trim_interval,
        max_connections: config.max_connections,
        max_connections_per_peer: config.max_connections_per_peer,
        max_memory_bytes: config.max_memory_bytes,
        idle_connection_timeout: config.governor.grace_period,
    };
    let governor = ConnectionGovernor::shared(config.governor);
    let overlay = Overlay::new(identity.keypair().clone(), overlay_config, governor.clone())?;
    let overlay_address = overlay.get_addr();
    let control = overlay.stream_control();

    let mut join_set = JoinSet::new();
    join_set.spawn(overlay.run());

    // Initialization can be cut short by a timeout or by the user.
    let join = tokio::time::timeout(
        config.init_timeout,
        overlay_address.request(|reply| OverlayMessage::Join(config.bootstrap.clone(), reply)),
    );
    select! {
        joined = join => match joined {
            Ok(joined) => {
                let connected = joined??;
                if connected == 0 && !config.bootstrap.is_empty() {
                    warn!("no bootstrap peer reachable, continuing with reduced connectivity");
                }
            }
            Err(_) => warn!(timeout = ?config.init_timeout, "joining the overlay timed out"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("initialization cancelled");
            return Err(DaemonError::Cancelled);
        }
    }

    // Initialize actors
    let role = match config.role {
        RoleKind::Host => Role::host(Arc::new(InterfaceBridge::new(config.interface.clone()))),
        RoleKind::Client => {
            let packet_logger = PacketLogger::new();
            let role = Role::client(packet_logger.get_addr());
            join_set.spawn(packet_logger.run());
            role
        }
    };
    let peer_collection = PeerCollection::new();
    let sessions = peer_collection.get_addr();
    let limiter = Arc::new(StreamLimiter::new(config.stream_limits, governor));
    let resolver = Arc::new(overlay_address.clone());
    let tunnel = Tunnel::new(
        control,
        resolver.clone(),
        limiter,
        Arc::new(role),
        sessions.clone(),
    )?;
    let controller = DaemonController::new(
        config.api_port,
        ControlContext {
            config_path: config.config_path.clone(),
            routes: RouteManager::new(Arc::new(IpRouteTable), resolver),
            overlay: overlay_address,
            tunnel: tunnel.get_addr(),
            sessions,
            full_tunnel: config.full_tunnel_gateway.map(|gateway| FullTunnel {
                interface: config.interface.name.clone(),
                gateway,
            }),
        },
    );

    // Run
    join_set.spawn(peer_collection.run());
    join_set.spawn(tunnel.run());
    join_set.spawn(async move {
        if let Err(error) = controller.run().await {
            error!(%error, "control API stopped");
        }
    });
    select! {
        _ = join_set.join_next() => Err(DaemonError::Died),
        _ = tokio::signal::ctrl_c() => {
            info!("stopping");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_skips_taken_ports() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }
        assert_eq!(first_free_tcp_port(port..=port + 1).unwrap(), port + 1);
        assert!(first_free_tcp_port(port..=port).is_err());
    }

    #[test]
    fn generated_identity_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            config_path: dir.path().join("config.json"),
            ..DaemonConfig::default()
        };
        let (_, first) = load_identity(&config).unwrap();
        let (saved, second) = load_identity(&config).unwrap();
        assert!(first.is_generated());
        assert!(!second.is_generated());
        assert_eq!(first.peer_id(), second.peer_id());
        assert!(!saved.private_key.is_empty());
    }
}
