//! Per-link worker: the port engine.
//!
//! One engine owns one serial link and runs four cooperative loops:
//!
//! ```text
//! link ──reader──▶ byte pipe ──reassembler──▶ frame queue ──dispatcher──▶ handler
//!
//! enqueue_out_control ─▶ control queue ─┐
//!                                       ├─sender──▶ pack ──▶ link
//! enqueue_out ────────▶ data queue ─────┘
//! ```
//!
//! The sender prefers the control queue at every dequeue decision, so
//! control frames overtake any backlog of data frames. A shared
//! cancellation token stops all four loops; a dead link cancels the engine.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use sermux_core::{pack_into, unstuff, Frame, FrameScanner};

use crate::{LinkError, RpcError, StreamLink};

/// Bytes read from the link per pass.
const READ_CHUNK: usize = 4096;

/// Raw byte chunks buffered between reader and reassembler.
const BYTE_PIPE_DEPTH: usize = 64;

/// Parsed frames buffered between reassembler and dispatcher.
const FRAME_QUEUE_DEPTH: usize = 256;

/// Pause before retrying a transient link error.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Async handler invoked by the dispatcher for every inbound frame.
pub type FrameHandler = Box<
    dyn Fn(Arc<PortEngine>, Frame) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send>>
        + Send
        + Sync,
>;

/// Traffic counters for one engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub traffic_in: u64,
    pub traffic_out: u64,
}

/// Worker for one physical link.
pub struct PortEngine {
    id: usize,
    link: StreamLink,
    control_queue: Mutex<VecDeque<Frame>>,
    data_queue: Mutex<VecDeque<Frame>>,
    outbound_ready: Notify,
    handler: Mutex<Option<FrameHandler>>,
    cancel: CancellationToken,
    started: AtomicBool,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    traffic_in: AtomicU64,
    traffic_out: AtomicU64,
}

impl PortEngine {
    pub fn new(id: usize, link: StreamLink) -> Arc<Self> {
        Arc::new(Self {
            id,
            link,
            control_queue: Mutex::new(VecDeque::new()),
            data_queue: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
            handler: Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            traffic_in: AtomicU64::new(0),
            traffic_out: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Register the inbound frame handler. Must happen before `start()`.
    pub fn set_frame_handler(&self, handler: FrameHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Spin up the four loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (byte_tx, byte_rx) = mpsc::channel::<Bytes>(BYTE_PIPE_DEPTH);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_DEPTH);

        tokio::spawn(self.clone().run_reader(byte_tx));
        tokio::spawn(self.clone().run_reassembler(byte_rx, frame_tx));
        tokio::spawn(self.clone().run_dispatcher(frame_rx));
        tokio::spawn(self.clone().run_sender());
        tracing::debug!(port = self.id, "port engine started");
    }

    /// Queue a data frame for transmission. Never suspends.
    pub fn enqueue_out(&self, frame: Frame) {
        self.data_queue.lock().push_back(frame);
        self.outbound_ready.notify_one();
    }

    /// Queue a control frame, which overtakes pending data frames.
    pub fn enqueue_out_control(&self, frame: Frame) {
        self.control_queue.lock().push_back(frame);
        self.outbound_ready.notify_one();
    }

    /// Outbound data-queue depth; the port-selection metric.
    pub fn back_pressure(&self) -> usize {
        self.data_queue.lock().len()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            traffic_in: self.traffic_in.load(Ordering::Relaxed),
            traffic_out: self.traffic_out.load(Ordering::Relaxed),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop all loops and close the link. Idempotent.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        self.outbound_ready.notify_one();
        self.link.close().await;
        tracing::debug!(port = self.id, "port engine disposed");
    }

    /// Control frames first, then data.
    pub(crate) fn pop_outbound(&self) -> Option<Frame> {
        if let Some(frame) = self.control_queue.lock().pop_front() {
            return Some(frame);
        }
        self.data_queue.lock().pop_front()
    }

    async fn run_reader(self: Arc<Self>, byte_tx: mpsc::Sender<Bytes>) {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.link.read(&mut scratch) => result,
            };
            match result {
                Ok(0) => {
                    tracing::debug!(port = self.id, "link end of stream");
                    break;
                }
                Ok(n) => {
                    self.traffic_in.fetch_add(n as u64, Ordering::Relaxed);
                    if byte_tx.send(Bytes::copy_from_slice(&scratch[..n])).await.is_err() {
                        break;
                    }
                }
                Err(LinkError::Closed) => break,
                Err(LinkError::Io(e)) if is_transient(&e) => {
                    tracing::warn!(port = self.id, error = %e, "transient read error, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(LinkError::Io(e)) => {
                    tracing::error!(port = self.id, error = %e, "link read failed");
                    break;
                }
            }
        }
        // A dead read side means a dead engine.
        self.cancel.cancel();
        self.outbound_ready.notify_one();
    }

    async fn run_reassembler(
        self: Arc<Self>,
        mut byte_rx: mpsc::Receiver<Bytes>,
        frame_tx: mpsc::Sender<Frame>,
    ) {
        let mut scanner = FrameScanner::new();
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = byte_rx.recv() => match chunk {
                    Some(c) => c,
                    None => break,
                },
            };
            scanner.push(&chunk);
            while let Some(body) = scanner.next_body() {
                match Frame::parse(&unstuff(&body)) {
                    Ok(frame) => {
                        self.frames_in.fetch_add(1, Ordering::Relaxed);
                        if frame_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // The scanner resynchronizes on the next STX.
                        tracing::warn!(port = self.id, error = %e, "dropping undecodable frame");
                    }
                }
            }
        }
    }

    async fn run_dispatcher(self: Arc<Self>, mut frame_rx: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = frame_rx.recv() => match frame {
                    Some(f) => f,
                    None => break,
                },
            };
            let fut = {
                let guard = self.handler.lock();
                match guard.as_ref() {
                    Some(handler) => handler(self.clone(), frame),
                    None => {
                        tracing::warn!(port = self.id, "inbound frame with no handler registered");
                        continue;
                    }
                }
            };
            // One bad frame must not kill the engine: errors and panics in
            // the handler are logged and swallowed.
            match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(port = self.id, error = %e, "frame handler failed");
                }
                Err(_) => {
                    tracing::error!(port = self.id, "frame handler panicked");
                }
            }
        }
    }

    async fn run_sender(self: Arc<Self>) {
        let mut raw = Vec::with_capacity(READ_CHUNK);
        let mut wire = Vec::with_capacity(READ_CHUNK);
        loop {
            let Some(frame) = self.pop_outbound() else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.outbound_ready.notified() => continue,
                }
            };

            raw.clear();
            frame.encode_into(&mut raw);
            pack_into(&raw, &mut wire);

            loop {
                let write = async {
                    self.link.write_all(&wire).await?;
                    self.link.flush().await
                };
                match write.await {
                    Ok(()) => {
                        self.frames_out.fetch_add(1, Ordering::Relaxed);
                        self.traffic_out.fetch_add(wire.len() as u64, Ordering::Relaxed);
                        break;
                    }
                    Err(LinkError::Closed) => return,
                    Err(LinkError::Io(e)) if is_transient(&e) => {
                        tracing::warn!(port = self.id, error = %e, "transient write error, retrying");
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                    Err(LinkError::Io(e)) => {
                        tracing::error!(port = self.id, error = %e, "link write failed");
                        self.cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PortEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortEngine")
            .field("id", &self.id)
            .field("back_pressure", &self.back_pressure())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn frame(cid: i64, payload: &[u8]) -> Frame {
        Frame::new(cid, Bytes::copy_from_slice(payload)).unwrap()
    }

    #[test]
    fn control_frames_jump_the_data_queue() {
        let (link, _peer) = StreamLink::pair();
        let engine = PortEngine::new(0, link);

        for i in 0..3 {
            engine.enqueue_out(frame(10 + i, b"data"));
        }
        engine.enqueue_out_control(frame(0, b"ctl"));
        assert_eq!(engine.back_pressure(), 3);

        // The next dequeue decision picks the control frame.
        assert_eq!(engine.pop_outbound().unwrap().channel_id, 0);
        assert_eq!(engine.pop_outbound().unwrap().channel_id, 10);
        assert_eq!(engine.pop_outbound().unwrap().channel_id, 11);
        assert_eq!(engine.pop_outbound().unwrap().channel_id, 12);
        assert!(engine.pop_outbound().is_none());
    }

    #[tokio::test]
    async fn frames_flow_between_engines() {
        let (link_a, link_b) = StreamLink::pair();
        let a = PortEngine::new(0, link_a);
        let b = PortEngine::new(1, link_b);

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        b.set_frame_handler(Box::new(move |_, f| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(f);
                Ok(())
            })
        }));
        a.start();
        b.start();

        a.enqueue_out(frame(42, b"\x02\x03\x10payload"));
        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("frame delivered");
        assert_eq!(received.channel_id, 42);
        assert_eq!(received.payload.as_ref(), b"\x02\x03\x10payload");

        assert_eq!(a.stats().frames_out, 1);
        assert_eq!(b.stats().frames_in, 1);
        assert!(b.stats().traffic_in > 0);

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test]
    async fn reassembler_resyncs_after_garbage() {
        let (link_a, link_b) = StreamLink::pair();
        let b = PortEngine::new(1, link_b);

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        b.set_frame_handler(Box::new(move |_, f| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(f);
                Ok(())
            })
        }));
        b.start();

        // Junk, then a frame whose body fails to parse, then a good frame.
        let mut stream = vec![0xAAu8, 0xBB];
        let mut bad = Vec::new();
        pack_into(b"short", &mut bad);
        stream.extend_from_slice(&bad);
        let good = frame(5, b"ok");
        let mut wire = Vec::new();
        pack_into(&good.encode(), &mut wire);
        stream.extend_from_slice(&wire);

        link_a.write_all(&stream).await.unwrap();
        link_a.flush().await.unwrap();

        let received = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("frame delivered");
        assert_eq!(received.channel_id, 5);
        assert_eq!(received.payload.as_ref(), b"ok");

        b.dispose().await;
    }

    #[tokio::test]
    async fn handler_error_does_not_kill_the_engine() {
        let (link_a, link_b) = StreamLink::pair();
        let b = PortEngine::new(1, link_b);

        let (tx, mut rx) = mpsc::unbounded_channel::<i64>();
        b.set_frame_handler(Box::new(move |_, f| {
            let tx = tx.clone();
            Box::pin(async move {
                if f.channel_id == 1 {
                    return Err(RpcError::Refused("bad frame".into()));
                }
                let _ = tx.send(f.channel_id);
                Ok(())
            })
        }));
        b.start();

        for f in [frame(1, b"boom"), frame(2, b"fine")] {
            let mut wire = Vec::new();
            pack_into(&f.encode(), &mut wire);
            link_a.write_all(&wire).await.unwrap();
        }
        link_a.flush().await.unwrap();

        let cid = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("frame delivered");
        assert_eq!(cid, 2);

        b.dispose().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (link, _peer) = StreamLink::pair();
        let engine = PortEngine::new(0, link);
        engine.start();
        engine.start();
        engine.dispose().await;
    }
}
