//! Module for [PeerCollection] actor.
//!
//! It owns every running tunnel session and can end them per peer.

use std::collections::HashMap;

use libp2p::PeerId;
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
};
use tracing::info;

use super::{peer::Peer, Actor, Addr};

pub enum PeerCollectionMessage {
    AddPeer(Peer),
    /// A session finished on its own.
    SessionEnded(PeerId, u64),
    /// Aborts every session with the peer, replying with how many there were.
    RemovePeer(PeerId, oneshot::Sender<usize>),
    /// Peers with at least one session, and their session counts.
    Peers(oneshot::Sender<Vec<(PeerId, usize)>>),
}

pub struct PeerCollection {
    message_address: Addr<PeerCollectionMessage>,
    message_receiver: mpsc::Receiver<PeerCollectionMessage>,
    peers: HashMap<PeerId, HashMap<u64, AbortHandle>>,
    next_session: u64,
}

impl PeerCollection {
    pub fn new() -> Self {
        let (message_sender, message_receiver) = mpsc::channel(16);
        Self {
            message_address: Addr::new(message_sender),
            message_receiver,
            peers: HashMap::new(),
            next_session: 0,
        }
    }

    fn handle_message(&mut self, message: PeerCollectionMessage) {
        match message {
            PeerCollectionMessage::AddPeer(peer) => {
                self.add_peer(peer);
            }
            PeerCollectionMessage::SessionEnded(peer_id, session) => {
                self.session_ended(peer_id, session);
            }
            PeerCollectionMessage::RemovePeer(peer_id, reply) => {
                let _ = reply.send(self.remove_peer(peer_id));
            }
            PeerCollectionMessage::Peers(reply) => {
                let _ = reply.send(self.peers());
            }
        }
    }

    fn add_peer(&mut self, peer: Peer) {
        let peer_id = peer.peer_id();
        let session = self.next_session;
        self.next_session += 1;

        let message_address = self.message_address.clone();
        let task = tokio::spawn(async move {
            peer.run().await;
            message_address
                .send_message(PeerCollectionMessage::SessionEnded(peer_id, session))
                .await;
        });
        self.peers
            .entry(peer_id)
            .or_default()
            .insert(session, task.abort_handle());
        info!(peer = %peer_id, session, "tunnel session started");
    }

    fn session_ended(&mut self, peer_id: PeerId, session: u64) {
        if let Some(sessions) = self.peers.get_mut(&peer_id) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.peers.remove(&peer_id);
            }
        }
    }

    fn remove_peer(&mut self, peer_id: PeerId) -> usize {
        let Some(sessions) = self.peers.remove(&peer_id) else {
            return 0;
        };
        for task in sessions.values() {
            task.abort();
        }
        info!(peer = %peer_id, sessions = sessions.len(), "tunnel sessions aborted");
        sessions.len()
    }

    fn peers(&self) -> Vec<(PeerId, usize)> {
        self.peers
            .iter()
            .map(|(peer_id, sessions)| (*peer_id, sessions.len()))
            .collect()
    }

    pub async fn run(mut self) {
        while let Some(message) = self.message_receiver.recv().await {
            self.handle_message(message);
        }
    }
}

impl Default for PeerCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl Actor<PeerCollectionMessage> for PeerCollection {
    fn get_addr(&self) -> Addr<PeerCollectionMessage> {
        self.message_address.clone()
    }
}
