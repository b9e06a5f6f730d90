//! The channel multiplexer: channel table, dispatch, and port selection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use sermux_core::{Frame, CONTROL_CHANNEL_ID};

use crate::{ControlChannel, FrontProtocol, PortEngine, RpcError, VirtualChannel};

/// Owner of the virtual channel table and one or more port engines.
///
/// Construction registers the dispatch handler on every engine and
/// instantiates the control channel; call [`start`](Self::start) to spin the
/// engines up. Channel ids are minted here, only on the side that services
/// Establish, so both peers agree on ownership without coordination.
pub struct ChannelMux {
    engines: Vec<Arc<PortEngine>>,
    channels: Mutex<HashMap<i64, Arc<VirtualChannel>>>,
    control: OnceLock<Arc<ControlChannel>>,
    next_cid: AtomicI64,
}

impl ChannelMux {
    /// Build a multiplexer over the given engines.
    ///
    /// # Panics
    ///
    /// Panics if `engines` is empty; a multiplexer without a link has
    /// nowhere to send anything.
    pub fn new(engines: Vec<Arc<PortEngine>>) -> Arc<Self> {
        assert!(!engines.is_empty(), "multiplexer needs at least one port engine");

        let mux = Arc::new(Self {
            engines,
            channels: Mutex::new(HashMap::new()),
            control: OnceLock::new(),
            next_cid: AtomicI64::new(1),
        });

        let control = ControlChannel::new(Arc::downgrade(&mux));
        mux.control
            .set(control)
            .unwrap_or_else(|_| unreachable!("control channel installed once"));

        for engine in &mux.engines {
            let weak = Arc::downgrade(&mux);
            engine.set_frame_handler(Box::new(move |port, frame| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(mux) => mux.dispatch(port, frame).await,
                        None => Ok(()),
                    }
                })
            }));
        }
        mux
    }

    /// Start every engine. Idempotent.
    pub fn start(&self) {
        for engine in &self.engines {
            engine.start();
        }
    }

    pub fn engines(&self) -> &[Arc<PortEngine>] {
        &self.engines
    }

    pub fn control(&self) -> &Arc<ControlChannel> {
        self.control.get().expect("control channel installed at construction")
    }

    /// Look up a live channel by id.
    pub fn channel(&self, cid: i64) -> Option<Arc<VirtualChannel>> {
        self.channels.lock().get(&cid).cloned()
    }

    /// Mint the next channel id. Nonzero, monotonic.
    pub fn allocate_cid(&self) -> i64 {
        self.next_cid.fetch_add(1, Ordering::Relaxed)
    }

    /// The engine with the shallowest data queue takes the next channel.
    pub fn select_engine(&self) -> Arc<PortEngine> {
        self.engines
            .iter()
            .min_by_key(|e| e.back_pressure())
            .expect("engines are never empty")
            .clone()
    }

    /// Create a channel under `cid`, bound to the least-loaded engine.
    pub fn new_channel(self: &Arc<Self>, cid: i64) -> Arc<VirtualChannel> {
        let engine = self.select_engine();
        let weak = Arc::downgrade(self);
        let channel = VirtualChannel::new(
            cid,
            Arc::downgrade(&engine),
            Box::new(move |cid| {
                if let Some(mux) = weak.upgrade() {
                    mux.kill(cid, "closed");
                }
            }),
        );
        self.channels.lock().insert(cid, channel.clone());
        tracing::debug!(cid, port = engine.id(), "channel created");
        channel
    }

    /// Allocate an id and create its channel; the Establish service path.
    pub fn open_remote(self: &Arc<Self>) -> i64 {
        let cid = self.allocate_cid();
        self.new_channel(cid);
        cid
    }

    /// Drop a channel from the table. Idempotent.
    pub fn kill(&self, cid: i64, reason: &str) {
        if self.channels.lock().remove(&cid).is_some() {
            tracing::debug!(cid, reason, "channel removed");
        }
    }

    /// Ask the peer for a channel id and create the local end.
    pub async fn establish(self: &Arc<Self>) -> Result<Arc<VirtualChannel>, RpcError> {
        let cid = self.control().establish(&CancellationToken::new()).await?;
        Ok(self.new_channel(cid))
    }

    /// Establish a channel and have the peer dial `host:port` for it.
    pub async fn open_tunnel(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        proto: FrontProtocol,
    ) -> Result<Arc<VirtualChannel>, RpcError> {
        let channel = self.establish().await?;
        let cancel = CancellationToken::new();
        match self
            .control()
            .connect(channel.cid(), host, port, proto, &cancel)
            .await
        {
            Ok(()) => Ok(channel),
            Err(e) => {
                channel.close();
                Err(e)
            }
        }
    }

    /// Close all channels and dispose every engine.
    pub async fn shutdown(&self) {
        let channels: Vec<_> = self.channels.lock().values().cloned().collect();
        for channel in channels {
            channel.close();
        }
        for engine in &self.engines {
            engine.dispose().await;
        }
    }

    /// Route one inbound frame: control payloads to the control processor
    /// on their own task, data payloads into the owning channel's pipe.
    pub(crate) async fn dispatch(
        self: Arc<Self>,
        port: Arc<PortEngine>,
        frame: Frame,
    ) -> Result<(), RpcError> {
        if frame.channel_id == CONTROL_CHANNEL_ID {
            // RPC work must not head-of-line block inflight data frames.
            let control = self.control().clone();
            tokio::spawn(async move { control.process(frame.payload).await });
            return Ok(());
        }

        let channel = self.channel(frame.channel_id);
        match channel {
            Some(channel) if frame.is_close_signal() => {
                tracing::debug!(cid = frame.channel_id, "peer closed channel");
                channel.peer_closed();
                self.kill(frame.channel_id, "peer close");
            }
            Some(channel) => channel.push_inbound(frame.payload).await,
            None => {
                tracing::debug!(
                    cid = frame.channel_id,
                    port = port.id(),
                    "frame for unknown channel dropped"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMux")
            .field("engines", &self.engines.len())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}
