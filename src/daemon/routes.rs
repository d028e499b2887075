//! Programming of the host routing table.
//!
//! Routes are added, never removed: they outlive the tunnels that needed
//! them. An operation stops at the first failing route-table call and does
//! not undo what it already installed.

use std::{net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use libp2p::PeerId;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::daemon::{
    addresses::PeerResolver,
    error::{DaemonError, RouteError},
};

/// The two halves of the IPv4 space. Together they match everything the
/// host default route matches, with a longer prefix.
pub const HALF_SPACE_ROUTES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub interface: String,
}

/// Interface and gateway of the host default route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultGateway {
    pub interface: String,
    pub gateway: Ipv4Addr,
}

#[async_trait]
pub trait RouteTable: Send + Sync {
    async fn default_gateway(&self) -> Result<DefaultGateway, RouteError>;
    async fn has_interface(&self, name: &str) -> Result<bool, RouteError>;
    /// Whether a route with exactly this destination exists.
    async fn has_route(&self, destination: Ipv4Net) -> Result<bool, RouteError>;
    async fn add_route(&self, entry: &RouteEntry) -> Result<(), RouteError>;
}

/// The system routing table, driven through iproute2.
#[derive(Debug, Default, Clone)]
pub struct IpRouteTable;

impl IpRouteTable {
    async fn ip(&self, args: &[&str]) -> Result<std::process::Output, RouteError> {
        if cfg!(not(target_os = "linux")) {
            return Err(RouteError::Unsupported);
        }
        let command = format!("ip {}", args.join(" "));
        debug!(%command, "running route command");
        Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|source| RouteError::Spawn { command, source })
    }

    async fn ip_checked(&self, args: &[&str]) -> Result<String, RouteError> {
        let output = self.ip(args).await?;
        if !output.status.success() {
            return Err(RouteError::Command {
                command: format!("ip {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn default_gateway(&self) -> Result<DefaultGateway, RouteError> {
        let routes = self.ip_checked(&["-4", "route", "show", "default"]).await?;
        parse_default_route(&routes).ok_or(RouteError::NoDefaultRoute)
    }

    async fn has_interface(&self, name: &str) -> Result<bool, RouteError> {
        Ok(self.ip(&["link", "show", "dev", name]).await?.status.success())
    }

    async fn has_route(&self, destination: Ipv4Net) -> Result<bool, RouteError> {
        let destination = destination.to_string();
        let routes = self
            .ip_checked(&["-4", "route", "show", "exact", &destination])
            .await?;
        Ok(!routes.trim().is_empty())
    }

    async fn add_route(&self, entry: &RouteEntry) -> Result<(), RouteError> {
        let destination = entry.destination.to_string();
        let gateway = entry.gateway.to_string();
        self.ip_checked(&[
            "-4",
            "route",
            "add",
            &destination,
            "via",
            &gateway,
            "dev",
            &entry.interface,
        ])
        .await?;
        Ok(())
    }
}

/// Reads the first gatewayed line of `ip -4 route show default`.
///
/// ```text
/// default via 192.168.1.1 dev eth0 proto dhcp metric 100
/// ```
fn parse_default_route(routes: &str) -> Option<DefaultGateway> {
    routes.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if words.next()? != "default" {
            return None;
        }
        let (mut gateway, mut interface) = (None, None);
        while let Some(word) = words.next() {
            match word {
                "via" => gateway = words.next().and_then(|gw| gw.parse().ok()),
                "dev" => interface = words.next().map(str::to_string),
                _ => {}
            }
        }
        Some(DefaultGateway {
            interface: interface?,
            gateway: gateway?,
        })
    })
}

pub struct RouteManager {
    table: Arc<dyn RouteTable>,
    resolver: Arc<dyn PeerResolver>,
}

impl RouteManager {
    pub fn new(table: Arc<dyn RouteTable>, resolver: Arc<dyn PeerResolver>) -> Self {
        Self { table, resolver }
    }

    /// Routes each public IPv4 address of `peer` through the host default
    /// gateway, so tunnel traffic keeps flowing once everything else goes
    /// into the tunnel. Destinations that already have a route are skipped.
    ///
    /// Returns the routes that were added.
    pub async fn add_endpoint_route(&self, peer: PeerId) -> Result<Vec<RouteEntry>, DaemonError> {
        let public = self.resolver.resolve(peer).await?.public_ipv4();
        if public.is_empty() {
            warn!(%peer, "peer has no public IPv4 address to route");
        }
        let DefaultGateway { interface, gateway } = self.table.default_gateway().await?;

        let mut added = Vec::new();
        for ip in public {
            let destination = Ipv4Net::new(ip, 32)
                .map_err(|_| RouteError::InvalidDestination(format!("{ip}/32")))?;
            if self.table.has_route(destination).await? {
                info!(%destination, "route already exists, skipping");
                continue;
            }
            let entry = RouteEntry {
                destination,
                gateway,
                interface: interface.clone(),
            };
            self.table.add_route(&entry).await?;
            info!(%destination, %gateway, %interface, "added endpoint route");
            added.push(entry);
        }
        Ok(added)
    }

    /// Sends all IPv4 traffic through `interface_name` via `gateway` without
    /// touching the host default route.
    pub async fn add_default_route(
        &self,
        interface_name: &str,
        gateway: &str,
    ) -> Result<Vec<RouteEntry>, DaemonError> {
        if !self.table.has_interface(interface_name).await? {
            return Err(RouteError::InterfaceNotFound(interface_name.to_string()).into());
        }
        let gateway: Ipv4Addr = gateway
            .parse()
            .map_err(|_| RouteError::InvalidGateway(gateway.to_string()))?;

        let mut added = Vec::new();
        for route in HALF_SPACE_ROUTES {
            let destination: Ipv4Net = route
                .parse()
                .map_err(|_| RouteError::InvalidDestination(route.to_string()))?;
            if self.table.has_route(destination).await? {
                info!(%destination, "route already exists, skipping");
                continue;
            }
            let entry = RouteEntry {
                destination,
                gateway,
                interface: interface_name.to_string(),
            };
            self.table.add_route(&entry).await?;
            info!(%destination, %gateway, interface = interface_name, "added default route");
            added.push(entry);
        }
        Ok(added)
    }
}
