//! The node configuration file.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::daemon::error::DaemonError;

pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

const REDACTED: &str = "<redacted>";

/// What a node persists between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default = "enabled")]
    pub debug: bool,
    /// Base64 of the protobuf-encoded keypair. Empty until a key is generated.
    #[serde(default)]
    pub private_key: String,
    /// Whether private and loopback addresses are announced to other peers.
    #[serde(default, alias = "adverstisePrivateAddresses")]
    pub advertise_private_addresses: bool,
}

fn enabled() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            debug: true,
            private_key: String::new(),
            advertise_private_addresses: false,
        }
    }
}

impl NodeConfig {
    /// Writes a default configuration to `path` unless a file is already
    /// there. Returns whether one was written.
    pub fn init(path: impl AsRef<Path>) -> Result<bool, DaemonError> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(false);
        }
        info!(path = %path.display(), "writing default configuration");
        Self::default().save(path)?;
        Ok(true)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DaemonError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut content = serde_json::to_vec_pretty(self)?;
        content.push(b'\n');
        fs::write(path, content)?;
        Ok(())
    }

    /// A copy that is safe to show: the private key is masked.
    pub fn redacted(&self) -> Self {
        let private_key = if self.private_key.is_empty() {
            String::new()
        } else {
            REDACTED.to_string()
        };
        Self {
            private_key,
            ..self.clone()
        }
    }
}
