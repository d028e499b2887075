//! # skypier: a peer-to-peer VPN node
//!
//! **skypier** tunnels IP packets between nodes of a libp2p overlay. Nodes
//! find each other through a Kademlia discovery table, connect over secured
//! multiplexed connections, and exchange packets on streams of the
//! `/skypier/1.0` protocol.
//!
//! ## How It Works
//! 1. **Joining**: at startup the node connects to a few public bootstrap
//!    peers and fills its discovery table from them.
//! 2. **Connecting**: asked to connect to a peer, the node looks the peer
//!    up, routes the peer's public addresses around the tunnel, and opens a
//!    tunnel stream to it.
//! 3. **Tunneling**: each stream carries length-prefixed IP packets. A node
//!    acting as a tunnel host delivers them onto a local TUN interface and
//!    sends the interface's packets back.
//!
//! A [connection governor](daemon::governor) keeps the number of live
//! connections between watermarks, and [stream limits](daemon::limits) cap
//! what a single peer can hold open.
//!
//! The daemon is driven through a small HTTP API; see [remote].
//!
//! ## Warning
//!
//! This solution does **not** give you anonymity, and it is highly
//! experimental. Use it at your own risk.

pub mod common;
pub mod daemon;
pub mod remote;
