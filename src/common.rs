//! What the daemon and its remote controllers agree on.

use std::{fmt, net::SocketAddr, str::FromStr};

use thiserror::Error;

/// Port of the HTTP control API.
pub const DEFAULT_API_PORT: u16 = 8081;

const API_PREFIX: &str = "/api/v0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonProcedure {
    /// Liveness check, answered with `OK`.
    Health,
    Ping,
    GetConfig,
    Connect(String),
    Disconnect(String),
    Peers,
}

impl fmt::Display for DaemonProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Health => write!(f, "{}/", API_PREFIX),
            Self::Ping => write!(f, "{}/ping", API_PREFIX),
            Self::GetConfig => write!(f, "{}/getConfig", API_PREFIX),
            Self::Connect(peer_id) => write!(f, "{}/connect/{}", API_PREFIX, peer_id),
            Self::Disconnect(peer_id) => write!(f, "{}/disconnect/{}", API_PREFIX, peer_id),
            Self::Peers => write!(f, "{}/peers", API_PREFIX),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown daemon procedure `{0}`")]
    BadDaemonProcedure(String),
}

impl FromStr for DaemonProcedure {
    type Err = ParseError;

    /// Parses the path of a control request.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let path = s.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
        match segments.as_slice() {
            [] | ["api", "v0"] => Ok(Self::Health),
            ["api", "v0", "ping"] => Ok(Self::Ping),
            ["api", "v0", "getConfig"] => Ok(Self::GetConfig),
            ["api", "v0", "connect", peer_id] => Ok(Self::Connect(peer_id.to_string())),
            ["api", "v0", "disconnect", peer_id] => Ok(Self::Disconnect(peer_id.to_string())),
            ["api", "v0", "peers"] => Ok(Self::Peers),
            _ => Err(ParseError::BadDaemonProcedure(s.to_string())),
        }
    }
}

/// Where the control API of a local daemon listens.
pub fn control_address(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
