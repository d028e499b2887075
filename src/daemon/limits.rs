//! Hard ceilings on concurrently open tunnel streams.

use std::{collections::HashMap, sync::Arc, time::Instant};

use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::daemon::{error::DaemonError, governor::SharedGovernor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_streams: usize,
    pub max_streams_per_peer: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_streams: 1024,
            max_streams_per_peer: 16,
        }
    }
}

pub struct StreamLimiter {
    limits: StreamLimits,
    total: Arc<Semaphore>,
    per_peer: Mutex<HashMap<PeerId, Arc<Semaphore>>>,
    governor: SharedGovernor,
}

impl StreamLimiter {
    pub fn new(limits: StreamLimits, governor: SharedGovernor) -> Self {
        Self {
            limits,
            total: Arc::new(Semaphore::new(limits.max_streams)),
            per_peer: Mutex::new(HashMap::new()),
            governor,
        }
    }

    /// Reserves one stream for `peer`, failing immediately when a ceiling is
    /// reached.
    pub fn acquire(&self, peer: PeerId) -> Result<StreamPermit, DaemonError> {
        let peer_semaphore = {
            let mut per_peer = self.per_peer.lock();
            let max = self.limits.max_streams_per_peer;
            per_peer.retain(|_, semaphore| {
                Arc::strong_count(semaphore) > 1 || semaphore.available_permits() < max
            });
            per_peer
                .entry(peer)
                .or_insert_with(|| Arc::new(Semaphore::new(max)))
                .clone()
        };
        let peer_permit = peer_semaphore.try_acquire_owned().map_err(|_| {
            warn!(%peer, limit = self.limits.max_streams_per_peer, "per-peer stream limit reached");
            DaemonError::StreamLimit(peer)
        })?;
        let total_permit = self.total.clone().try_acquire_owned().map_err(|_| {
            warn!(%peer, limit = self.limits.max_streams, "stream limit reached");
            DaemonError::StreamLimit(peer)
        })?;

        self.governor.lock().stream_opened(peer, Instant::now());
        Ok(StreamPermit {
            peer,
            governor: self.governor.clone(),
            _peer_permit: peer_permit,
            _total_permit: total_permit,
        })
    }

    pub fn available(&self) -> usize {
        self.total.available_permits()
    }
}

/// One reserved stream. Dropping it gives the reservation back and tells the
/// governor the stream is gone.
#[derive(Debug)]
pub struct StreamPermit {
    peer: PeerId,
    governor: SharedGovernor,
    _peer_permit: OwnedSemaphorePermit,
    _total_permit: OwnedSemaphorePermit,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.governor
            .lock()
            .stream_closed(self.peer, Instant::now());
    }
}
