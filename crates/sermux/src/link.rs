//! The serial link seam.
//!
//! Opening and configuring the physical device is a collaborator concern:
//! whatever owns the device hands its byte stream in as any
//! `AsyncRead + AsyncWrite` value, and [`StreamLink`] splits it into
//! independently locked read and write halves. Tests use
//! [`StreamLink::pair`] to get two ends of an in-memory link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::LinkError;

/// A byte-stream link to the peer, shared by the engine's loops.
#[derive(Clone)]
pub struct StreamLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for StreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct LinkInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send>>,
    closed: AtomicBool,
}

impl StreamLink {
    /// Wrap a duplex byte stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(LinkInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// An in-memory link pair, for tests and demos.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Read available bytes into `buf`. `Ok(0)` is end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let mut reader = self.inner.reader.lock().await;
        reader.read(buf).await.map_err(LinkError::from)
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(buf).await.map_err(LinkError::from)
    }

    /// Flush the write side.
    pub async fn flush(&self) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.flush().await.map_err(LinkError::from)
    }

    /// Shut the link down. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_moves_bytes_both_ways() {
        let (a, b) = StreamLink::pair();
        a.write_all(b"ping").await.unwrap();
        a.flush().await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        b.write_all(b"pong").await.unwrap();
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn close_makes_operations_fail() {
        let (a, _b) = StreamLink::pair();
        a.close().await;
        assert!(matches!(a.write_all(b"x").await, Err(LinkError::Closed)));
        let mut buf = [0u8; 4];
        assert!(matches!(a.read(&mut buf).await, Err(LinkError::Closed)));
        // Idempotent.
        a.close().await;
    }

    #[tokio::test]
    async fn peer_close_reads_eof() {
        let (a, b) = StreamLink::pair();
        a.close().await;
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
