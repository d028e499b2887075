//! Framing of IP packets on tunnel streams.
//!
//! A frame is a 2-byte little-endian length followed by that many bytes of
//! packet. There is no version field and no checksum; integrity and ordering
//! come from the secured stream underneath.

use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::daemon::error::FrameError;

pub const FRAME_HEADER_LEN: usize = 2;

/// Largest payload a frame can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Encodes `payload` as one frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let size = u16::try_from(payload.len()).map_err(|_| FrameError::Oversized(payload.len()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes `payload` as one frame and flushes it.
///
/// Header and payload go out in a single write so that a frame is never
/// split across two writes of the same stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads frames off one stream. Each stream owns its own reader, so frame
/// boundaries of different streams never mix.
pub struct FrameReader<R> {
    reader: R,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Returns the next frame payload, or `None` when the stream ended
    /// cleanly on a frame boundary.
    ///
    /// Partial reads are accumulated until the whole frame is present. A
    /// stream that ends in the middle of a frame is an error.
    pub async fn next_frame(&mut self) -> Result<Option<Arc<[u8]>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let received = self.fill(&mut header).await?;
        if received == 0 {
            return Ok(None);
        }
        if received < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                expected: FRAME_HEADER_LEN,
                received,
            });
        }

        let size = u16::from_le_bytes(header) as usize;
        let mut payload = vec![0u8; size];
        let received = self.fill(&mut payload).await?;
        if received < size {
            return Err(FrameError::Truncated {
                expected: size,
                received,
            });
        }
        Ok(Some(Arc::from(payload)))
    }

    /// Reads until `buffer` is full or the stream ends, returning how many
    /// bytes were read.
    async fn fill(&mut self, buffer: &mut [u8]) -> Result<usize, FrameError> {
        let mut filled = 0;
        while filled < buffer.len() {
            match self.reader.read(&mut buffer[filled..]).await? {
                0 => break,
                read => filled += read,
            }
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use futures::io::Cursor;

    use super::*;

    /// Hands out at most `chunk` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        position: usize,
        chunk: usize,
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            let remaining = self.data.len() - self.position;
            let count = remaining.min(self.chunk).min(buf.len());
            let start = self.position;
            buf[..count].copy_from_slice(&self.data[start..start + count]);
            self.position += count;
            Poll::Ready(Ok(count))
        }
    }

    #[test]
    fn header_is_little_endian() {
        let frame = encode_frame(&[0xaa; 0x0102]).unwrap();
        assert_eq!(&frame[..2], &[0x02, 0x01]);
        assert_eq!(frame.len(), 0x0102 + FRAME_HEADER_LEN);
    }

    #[test]
    fn refuses_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(FrameError::Oversized(size)) if size == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn reassembles_frames_from_single_byte_reads() {
        let packets: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![], (0..=255).collect(), vec![7; 1420]];
        let mut data = Vec::new();
        for packet in &packets {
            data.extend(encode_frame(packet).unwrap());
        }

        for chunk in [1, 2, 3, 1000] {
            let mut reader = FrameReader::new(Trickle {
                data: data.clone(),
                position: 0,
                chunk,
            });
            for packet in &packets {
                let frame = reader.next_frame().await.unwrap().unwrap();
                assert_eq!(&frame[..], &packet[..]);
            }
            assert!(reader.next_frame().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn largest_frame_survives() {
        let payload: Vec<u8> = (0..MAX_FRAME_LEN).map(|i| (i % 251) as u8).collect();
        let mut reader = FrameReader::new(Trickle {
            data: encode_frame(&payload).unwrap(),
            position: 0,
            chunk: 4096,
        });
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(&frame[..], &payload[..]);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let mut data = encode_frame(&[9; 10]).unwrap();
        data.truncate(7);
        let mut reader = FrameReader::new(Cursor::new(data));
        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::Truncated { expected: 10, received: 5 })
        ));
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let mut reader = FrameReader::new(Cursor::new(vec![4u8]));
        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::Truncated { expected: 2, received: 1 })
        ));
    }

    #[tokio::test]
    async fn write_frame_emits_one_frame() {
        let mut output = Cursor::new(Vec::new());
        write_frame(&mut output, b"hello").await.unwrap();
        assert_eq!(output.into_inner(), b"\x05\x00hello".to_vec());
    }
}
