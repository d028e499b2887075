//! Module for [Tunnel] actor.
//!
//! It accepts tunnel streams opened by remote peers and opens them to peers
//! on request. Each stream becomes a [Peer] session in the
//! [PeerCollection](super::peer_collection::PeerCollection).

use std::sync::Arc;

use futures::{AsyncWriteExt, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use libp2p_stream::{Control, IncomingStreams};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

use crate::daemon::{addresses::PeerResolver, error::DaemonError, limits::StreamLimiter, role::Role};

use super::{
    peer::{Peer, TunnelStream},
    peer_collection::PeerCollectionMessage,
    Actor, Addr,
};

/// Protocol identifier of tunnel streams.
pub const TUNNEL_PROTOCOL: StreamProtocol = StreamProtocol::new("/skypier/1.0");

pub enum TunnelMessage {
    /// Opens a tunnel stream to a peer, looking it up first.
    Open(PeerId, oneshot::Sender<Result<(), DaemonError>>),
}

/// What every stream needs, whichever side opened it.
#[derive(Clone)]
struct TunnelContext {
    role: Arc<Role>,
    limiter: Arc<StreamLimiter>,
    sessions: Addr<PeerCollectionMessage>,
}

impl TunnelContext {
    /// Registers a session over `stream`, or closes the stream when no
    /// permit is left.
    async fn start_session(&self, peer: PeerId, mut stream: impl TunnelStream) {
        match self.limiter.acquire(peer) {
            Ok(permit) => {
                let session = Peer::new(peer, stream, self.role.clone(), permit);
                self.sessions
                    .send_message(PeerCollectionMessage::AddPeer(session))
                    .await;
            }
            Err(error) => {
                warn!(%peer, %error, "refusing tunnel stream");
                let _ = stream.close().await;
            }
        }
    }
}

pub struct Tunnel {
    address: Addr<TunnelMessage>,
    receiver: mpsc::Receiver<TunnelMessage>,
    control: Control,
    incoming: IncomingStreams,
    resolver: Arc<dyn PeerResolver>,
    context: TunnelContext,
}

impl Tunnel {
    /// Registers the tunnel protocol on `control`. Fails if it is already
    /// registered.
    pub fn new(
        mut control: Control,
        resolver: Arc<dyn PeerResolver>,
        limiter: Arc<StreamLimiter>,
        role: Arc<Role>,
        sessions: Addr<PeerCollectionMessage>,
    ) -> Result<Self, DaemonError> {
        let incoming = control.accept(TUNNEL_PROTOCOL)?;
        let (sender, receiver) = mpsc::channel(16);
        Ok(Self {
            address: Addr::new(sender),
            receiver,
            control,
            incoming,
            resolver,
            context: TunnelContext {
                role,
                limiter,
                sessions,
            },
        })
    }

    async fn open(
        peer: PeerId,
        mut control: Control,
        resolver: Arc<dyn PeerResolver>,
        context: TunnelContext,
    ) -> Result<(), DaemonError> {
        resolver.resolve(peer).await?;
        let permit = context.limiter.acquire(peer)?;
        let stream = control.open_stream(peer, TUNNEL_PROTOCOL).await?;
        info!(%peer, "opened tunnel stream");
        let session = Peer::new(peer, stream, context.role.clone(), permit);
        context
            .sessions
            .send_message(PeerCollectionMessage::AddPeer(session))
            .await;
        Ok(())
    }

    fn handle_message(&self, message: TunnelMessage) {
        match message {
            TunnelMessage::Open(peer, reply) => {
                let control = self.control.clone();
                let resolver = self.resolver.clone();
                let context = self.context.clone();
                // Lookups can take a while; other streams must not wait on them.
                tokio::spawn(async move {
                    let result = Self::open(peer, control, resolver, context).await;
                    if let Err(error) = &result {
                        warn!(%peer, %error, "cannot open tunnel stream");
                    }
                    let _ = reply.send(result);
                });
            }
        }
    }

    pub async fn run(mut self) {
        loop {
            select! {
                Some((peer, stream)) = self.incoming.next() => {
                    info!(%peer, "accepted tunnel stream");
                    self.context.start_session(peer, stream).await;
                }
                Some(message) = self.receiver.recv() => self.handle_message(message),
                else => break,
            }
        }
    }
}

impl Actor<TunnelMessage> for Tunnel {
    fn get_addr(&self) -> Addr<TunnelMessage> {
        self.address.clone()
    }
}
