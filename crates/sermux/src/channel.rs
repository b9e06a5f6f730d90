//! Virtual channels: multiplexed duplex byte streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use sermux_core::{Frame, MTU};

use crate::{LinkError, PortEngine};

/// Inbound chunks buffered per channel; fills up to exert backpressure on
/// the dispatcher.
const INBOUND_DEPTH: usize = 64;

/// Invoked once when the channel leaves service, with its cid.
pub type CloseCallback = Box<dyn Fn(i64) + Send + Sync>;

/// One multiplexed byte stream.
///
/// The write side slices into MTU-sized frames and enqueues them on the
/// owning engine's data queue, in order. The read side drains a
/// backpressured pipe that the multiplexer fills; reads block until data
/// arrives or the channel closes.
pub struct VirtualChannel {
    cid: i64,
    engine: Weak<PortEngine>,
    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound: AsyncMutex<Inbound>,
    alive: AtomicBool,
    locally_closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
}

struct Inbound {
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

impl VirtualChannel {
    pub(crate) fn new(cid: i64, engine: Weak<PortEngine>, on_close: CloseCallback) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_DEPTH);
        Arc::new(Self {
            cid,
            engine,
            inbound_tx: Mutex::new(Some(tx)),
            inbound: AsyncMutex::new(Inbound {
                rx,
                leftover: Bytes::new(),
            }),
            alive: AtomicBool::new(true),
            locally_closed: AtomicBool::new(false),
            on_close: Mutex::new(Some(on_close)),
        })
    }

    pub fn cid(&self) -> i64 {
        self.cid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Blocks until data arrives or the peer closes; returns `Ok(0)` once
    /// the inbound pipe is complete and drained. Fails with
    /// [`LinkError::Closed`] after a local `close()`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.locally_closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        if inbound.leftover.is_empty() {
            match inbound.rx.recv().await {
                Some(chunk) => inbound.leftover = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(inbound.leftover.len());
        buf[..n].copy_from_slice(&inbound.leftover[..n]);
        inbound.leftover.advance(n);
        Ok(n)
    }

    /// Write the whole buffer, slicing into MTU-sized frames.
    ///
    /// Enqueueing never suspends; backpressure on the link shows up as
    /// data-queue depth, not as a blocked writer.
    pub fn write(&self, buf: &[u8]) -> Result<(), LinkError> {
        if !self.is_alive() {
            return Err(LinkError::Closed);
        }
        let engine = self.engine.upgrade().ok_or(LinkError::Closed)?;
        for chunk in buf.chunks(MTU) {
            let frame = Frame::new(self.cid, Bytes::copy_from_slice(chunk))
                .expect("chunk within MTU");
            engine.enqueue_out(frame);
        }
        Ok(())
    }

    /// Close the channel: send the empty-payload close signal, complete the
    /// inbound pipe, and fire the close callback. Idempotent.
    pub fn close(&self) {
        if self.locally_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Only signal the peer if it has not already closed on us.
        if self.alive.swap(false, Ordering::AcqRel) {
            if let Some(engine) = self.engine.upgrade() {
                engine.enqueue_out(Frame::close_signal(self.cid));
            }
        }
        self.inbound_tx.lock().take();
        self.fire_close();
    }

    /// The peer sent its close signal: complete the pipe and go non-live.
    /// Buffered bytes remain readable; the next read after drain is EOF.
    pub(crate) fn peer_closed(&self) {
        self.alive.store(false, Ordering::Release);
        self.inbound_tx.lock().take();
        self.fire_close();
    }

    /// Push a payload into the inbound pipe. Suspends when the consumer is
    /// behind; that is the backpressure path.
    pub(crate) async fn push_inbound(&self, payload: Bytes) {
        let tx = self.inbound_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(payload).await.is_err() {
                tracing::trace!(cid = self.cid, "inbound pipe receiver gone");
            }
        } else {
            tracing::trace!(cid = self.cid, "payload for completed channel dropped");
        }
    }

    fn fire_close(&self) {
        if let Some(cb) = self.on_close.lock().take() {
            cb(self.cid);
        }
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("cid", &self.cid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamLink;
    use std::sync::atomic::AtomicUsize;

    fn test_channel(cid: i64) -> (Arc<VirtualChannel>, Arc<PortEngine>, Arc<AtomicUsize>) {
        let (link, _peer) = StreamLink::pair();
        let engine = PortEngine::new(0, link);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let chan = VirtualChannel::new(
            cid,
            Arc::downgrade(&engine),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (chan, engine, closes)
    }

    #[tokio::test]
    async fn write_slices_to_mtu_in_order() {
        let (chan, engine, _) = test_channel(9);
        chan.write(&vec![0x55u8; 3000]).unwrap();

        assert_eq!(engine.back_pressure(), 3);
        let sizes: Vec<usize> = std::iter::from_fn(|| engine.pop_outbound())
            .map(|f| {
                assert_eq!(f.channel_id, 9);
                f.payload.len()
            })
            .collect();
        assert_eq!(sizes, vec![1400, 1400, 200]);
    }

    #[tokio::test]
    async fn read_blocks_until_data_then_drains() {
        let (chan, _engine, _) = test_channel(1);

        let reader = chan.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = reader.read(&mut buf).await.unwrap();
            (n, buf)
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished(), "read must block while the pipe is empty");

        chan.push_inbound(Bytes::from_static(b"abcdef")).await;
        let (n, buf) = task.await.unwrap();
        assert_eq!((n, &buf[..n]), (4, &b"abcd"[..]));

        // Short read leftover is served first.
        let mut buf = [0u8; 8];
        let n = chan.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn peer_close_yields_eof_after_drain() {
        let (chan, _engine, closes) = test_channel(2);
        chan.push_inbound(Bytes::from_static(b"tail")).await;
        chan.peer_closed();

        assert!(!chan.is_alive());
        let mut buf = [0u8; 16];
        assert_eq!(chan.read(&mut buf).await.unwrap(), 4);
        assert_eq!(chan.read(&mut buf).await.unwrap(), 0);
        assert_eq!(chan.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(chan.write(b"x"), Err(LinkError::Closed)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_close_sends_signal_once() {
        let (chan, engine, closes) = test_channel(3);
        chan.close();
        chan.close();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let frame = engine.pop_outbound().unwrap();
        assert!(frame.is_close_signal());
        assert_eq!(frame.channel_id, 3);
        assert!(engine.pop_outbound().is_none());

        let mut buf = [0u8; 4];
        assert!(matches!(chan.read(&mut buf).await, Err(LinkError::Closed)));
        assert!(matches!(chan.write(b"x"), Err(LinkError::Closed)));
    }

    #[tokio::test]
    async fn close_after_peer_close_sends_no_signal() {
        let (chan, engine, _) = test_channel(4);
        chan.peer_closed();
        chan.close();
        assert!(engine.pop_outbound().is_none());
    }
}
