//! Module for [Peer] actor.
//!
//! A [Peer] is one tunnel stream with a remote peer. It moves frames in both
//! directions until the stream closes.

use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::PeerId;
use tokio::{select, sync::oneshot};
use tracing::{debug, info, warn};

use crate::daemon::{
    frame::{write_frame, FrameReader},
    interface::InterfaceBridge,
    limits::StreamPermit,
    role::Role,
};

/// A byte stream a tunnel can run over.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Represents one tunnel stream with a peer.
pub struct Peer {
    peer_id: PeerId,
    stream: Box<dyn TunnelStream>,
    role: Arc<Role>,
    permit: StreamPermit,
}

impl Peer {
    /// Creates a session over `stream`. The permit is held until the session
    /// ends, whichever way it ends.
    pub fn new(
        peer_id: PeerId,
        stream: impl TunnelStream,
        role: Arc<Role>,
        permit: StreamPermit,
    ) -> Self {
        Self {
            peer_id,
            stream: Box::new(stream),
            role,
            permit,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Hands every frame read from the stream to the role.
    async fn ingress<R>(peer_id: PeerId, frames: &mut FrameReader<R>, role: &Role)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match frames.next_frame().await {
                Ok(Some(packet)) => {
                    if let Err(error) = role.deliver(peer_id, packet).await {
                        warn!(peer = %peer_id, %error, "cannot deliver tunnel packets");
                        return;
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer_id, "tunnel stream closed by peer");
                    return;
                }
                Err(error) => {
                    debug!(peer = %peer_id, %error, "tunnel stream read failed");
                    return;
                }
            }
        }
    }

    /// Frames every packet read from the interface onto the stream, one frame
    /// per read.
    async fn egress<W>(peer_id: PeerId, writer: &mut W, bridge: &InterfaceBridge)
    where
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; bridge.mtu()];
        loop {
            let size = match bridge.read(&mut buffer).await {
                Ok(0) => {
                    debug!(peer = %peer_id, "interface closed");
                    return;
                }
                Ok(size) => size,
                Err(error) => {
                    warn!(peer = %peer_id, %error, "interface read failed");
                    return;
                }
            };
            if let Err(error) = write_frame(writer, &buffer[..size]).await {
                debug!(peer = %peer_id, %error, "tunnel stream write failed");
                return;
            }
        }
    }

    /// Runs both directions of the stream concurrently, then closes it and
    /// releases its permit.
    ///
    /// A failing direction stops on its own. Egress also stops once ingress
    /// has, since the peer is gone by then.
    pub async fn run(self) {
        let Self {
            peer_id,
            stream,
            role,
            permit,
        } = self;
        info!(peer = %peer_id, role = %role.kind(), "tunnel stream opened");

        let (reader, mut writer) = stream.split();
        let mut frames = FrameReader::new(reader);
        let (ingress_done, mut ingress_finished) = oneshot::channel::<()>();

        let ingress = async {
            Self::ingress(peer_id, &mut frames, &role).await;
            let _ = ingress_done.send(());
        };
        let egress = async {
            if let Some(bridge) = role.egress_source() {
                select! {
                    _ = Self::egress(peer_id, &mut writer, bridge) => {}
                    _ = &mut ingress_finished => {}
                }
            }
        };
        tokio::join!(ingress, egress);

        if let Err(error) = writer.close().await {
            debug!(peer = %peer_id, %error, "closing tunnel stream failed");
        }
        drop(frames);
        drop(writer);
        drop(permit);
        info!(peer = %peer_id, "tunnel stream closed");
    }
}
