//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use skypier::daemon::{
    governor::{ConnectionGovernor, GovernorConfig},
    interface::{InterfaceBridge, InterfaceConfig, InterfaceHandle},
    limits::{StreamLimiter, StreamLimits},
};
use tokio::io::{DuplexStream, ReadBuf};

/// A tokio pipe end, seen through the futures I/O traits that tunnel streams
/// use.
pub struct MemoryStream(DuplexStream);

impl futures::AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut read_buf = ReadBuf::new(buf);
        match tokio::io::AsyncRead::poll_read(Pin::new(&mut self.0), cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl futures::AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        tokio::io::AsyncWrite::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        tokio::io::AsyncWrite::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

/// Two connected stream ends.
pub fn stream_pair() -> (MemoryStream, MemoryStream) {
    let (near, far) = tokio::io::duplex(256 * 1024);
    (MemoryStream(near), MemoryStream(far))
}

pub type FarEnd = Arc<Mutex<Option<DuplexStream>>>;

/// An interface bridge over an in-memory pipe. The far end of the pipe plays
/// the operating system and appears once the device is created.
pub fn memory_bridge() -> (Arc<InterfaceBridge>, FarEnd) {
    let far_end: FarEnd = Arc::new(Mutex::new(None));
    let slot = far_end.clone();
    let bridge = InterfaceBridge::with_factory(
        InterfaceConfig::default(),
        Box::new(move |_: &InterfaceConfig| {
            let (near, far) = tokio::io::duplex(256 * 1024);
            *slot.lock().unwrap() = Some(far);
            Ok(InterfaceHandle::new(near))
        }),
    );
    (Arc::new(bridge), far_end)
}

pub fn take_far_end(far_end: &FarEnd) -> DuplexStream {
    far_end.lock().unwrap().take().expect("device not created")
}

pub fn limiter(max_streams: usize, max_streams_per_peer: usize) -> Arc<StreamLimiter> {
    Arc::new(StreamLimiter::new(
        StreamLimits {
            max_streams,
            max_streams_per_peer,
        },
        ConnectionGovernor::shared(GovernorConfig::default()),
    ))
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

pub fn ipv4_packet(source: [u8; 4], destination: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut packet = vec![0x45, 0x00];
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00]);
    packet.extend_from_slice(&source);
    packet.extend_from_slice(&destination);
    packet.extend_from_slice(payload);
    packet
}
