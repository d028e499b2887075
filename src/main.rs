use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use libp2p::Multiaddr;
use skypier::{
    common::DEFAULT_API_PORT,
    daemon::{
        config::{NodeConfig, DEFAULT_CONFIG_PATH},
        run_daemon,
        role::RoleKind,
        DaemonConfig,
    },
    remote,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "skypier", version, about = "Peer-to-peer VPN node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the node.
    Daemon(DaemonArgs),
    /// Tunnel to a peer through the running node.
    Connect(PeerArgs),
    /// End every tunnel with a peer.
    Disconnect(PeerArgs),
    /// Peers with open tunnels.
    Peers(ApiArgs),
    /// The running node's configuration, without its private key.
    Config(ApiArgs),
    /// Check that the node answers.
    Ping(ApiArgs),
}

#[derive(Debug, Args)]
struct ApiArgs {
    /// Port of the node's control API.
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    api_port: u16,
}

#[derive(Debug, Args)]
struct PeerArgs {
    peer_id: String,
    #[command(flatten)]
    api: ApiArgs,
}

#[derive(Debug, Args)]
struct DaemonArgs {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// `host` delivers tunnel traffic onto the local interface.
    #[arg(long, default_value_t = RoleKind::Client)]
    role: RoleKind,
    #[command(flatten)]
    api: ApiArgs,
    #[arg(long)]
    tcp_port: Option<u16>,
    #[arg(long)]
    udp_port: Option<u16>,
    /// Replaces the default bootstrap peers. May be repeated.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<Multiaddr>,
    /// Start without contacting any bootstrap peer.
    #[arg(long, conflicts_with = "bootstrap")]
    no_bootstrap: bool,
    #[arg(long)]
    interface: Option<String>,
    #[arg(long)]
    mtu: Option<u16>,
    /// Route all IPv4 traffic through this gateway on the tunnel interface
    /// after each successful connect.
    #[arg(long)]
    full_tunnel_gateway: Option<Ipv4Addr>,
    #[arg(long)]
    low_watermark: Option<usize>,
    #[arg(long)]
    high_watermark: Option<usize>,
    /// Seconds a connection must stay unused before it can be evicted.
    #[arg(long)]
    grace_period: Option<u64>,
    /// Seconds allowed for joining the overlay at startup.
    #[arg(long)]
    init_timeout: Option<u64>,
}

impl DaemonArgs {
    fn into_config(self) -> DaemonConfig {
        let mut config = DaemonConfig {
            config_path: self.config,
            role: self.role,
            api_port: self.api.api_port,
            tcp_port: self.tcp_port,
            udp_port: self.udp_port,
            full_tunnel_gateway: self.full_tunnel_gateway,
            ..DaemonConfig::default()
        };
        if self.no_bootstrap {
            config.bootstrap.clear();
        } else if !self.bootstrap.is_empty() {
            config.bootstrap = self.bootstrap;
        }
        if let Some(name) = self.interface {
            config.interface.name = name;
        }
        if let Some(mtu) = self.mtu {
            config.interface.mtu = mtu;
        }
        if let Some(low) = self.low_watermark {
            config.governor.low_watermark = low;
        }
        if let Some(high) = self.high_watermark {
            config.governor.high_watermark = high;
        }
        if let Some(grace) = self.grace_period {
            config.governor.grace_period = Duration::from_secs(grace);
        }
        if let Some(timeout) = self.init_timeout {
            config.init_timeout = Duration::from_secs(timeout);
        }
        config
    }
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { "info,skypier=debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Daemon(args) => {
            // A missing or unreadable file means defaults, which have debug on.
            let debug = NodeConfig::load(&args.config)
                .map(|config| config.debug)
                .unwrap_or(true);
            init_logging(debug);
            run_daemon(args.into_config())
                .await
                .context("daemon stopped")?;
        }
        Command::Connect(args) => {
            init_logging(false);
            print(remote::connect_peer(args.api.api_port, &args.peer_id).await?)?;
        }
        Command::Disconnect(args) => {
            init_logging(false);
            print(remote::disconnect_peer(args.api.api_port, &args.peer_id).await?)?;
        }
        Command::Peers(args) => {
            init_logging(false);
            print(remote::list_peers(args.api_port).await?)?;
        }
        Command::Config(args) => {
            init_logging(false);
            print(remote::get_config(args.api_port).await?)?;
        }
        Command::Ping(args) => {
            init_logging(false);
            print(remote::ping(args.api_port).await?)?;
        }
    }
    Ok(())
}
