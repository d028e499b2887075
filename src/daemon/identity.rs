//! The node's keypair.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use libp2p::{identity::Keypair, PeerId};
use tracing::info;

use crate::daemon::{config::NodeConfig, error::DaemonError};

pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
    generated: bool,
}

impl NodeIdentity {
    /// Decodes the key stored in `config`, or generates an Ed25519 key and
    /// stores it there when there is none. A stored key that cannot be
    /// decoded is an error, never silently replaced.
    pub fn load_or_generate(config: &mut NodeConfig) -> Result<Self, DaemonError> {
        if !config.private_key.is_empty() {
            let encoded = STANDARD.decode(config.private_key.trim())?;
            let keypair = Keypair::from_protobuf_encoding(&encoded)?;
            return Ok(Self::new(keypair, false));
        }

        let keypair = Keypair::generate_ed25519();
        config.private_key = STANDARD.encode(keypair.to_protobuf_encoding()?);
        let identity = Self::new(keypair, true);
        info!(peer_id = %identity.peer_id, "generated a new identity");
        Ok(identity)
    }

    fn new(keypair: Keypair, generated: bool) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self {
            keypair,
            peer_id,
            generated,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Whether the key was created by this call and still has to be saved.
    pub fn is_generated(&self) -> bool {
        self.generated
    }
}
