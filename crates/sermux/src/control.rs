//! The control channel: channel 0 RPC over typed payload maps.
//!
//! Every control message is a serialized [`VarMap`] carrying `Tk` (the
//! correlation token), `Cmd`, `Flag`, and an optional `Data` value.
//! Requests set `Flag = Control`; responses set `Flag = Callback`, echo the
//! request's token, and carry the result in `Data`. Tokens are issued here
//! as monotonically increasing i64 values; GUID tokens from the peer are
//! accepted and echoed back unchanged.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sermux_core::{Frame, MapError, Value, VarMap, CONTROL_CHANNEL_ID};

use crate::{ChannelMux, RpcError, VirtualChannel};

/// Reserved message keys.
pub const KEY_TOKEN: &str = "Tk";
pub const KEY_COMMAND: &str = "Cmd";
pub const KEY_FLAG: &str = "Flag";
pub const KEY_DATA: &str = "Data";
pub const KEY_HOST: &str = "host";
pub const KEY_PORT: &str = "port";
pub const KEY_PROTO: &str = "v";

/// Control commands. Wire values are frozen.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Unset = 0,
    Establish = 1,
    Dispose = 2,
    Connect = 3,
    Request = 4,
}

impl Command {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => Self::Unset,
            1 => Self::Establish,
            2 => Self::Dispose,
            3 => Self::Connect,
            4 => Self::Request,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Message direction marker. Wire values are frozen.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    Unset = 0,
    Control = 1,
    Callback = 2,
}

impl ControlFlag {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => Self::Unset,
            1 => Self::Control,
            2 => Self::Callback,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Front-end protocol marker carried by Connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontProtocol {
    HttpConnect,
    Socks5,
}

impl FrontProtocol {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::HttpConnect),
            5 => Some(Self::Socks5),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::HttpConnect => 0,
            Self::Socks5 => 5,
        }
    }
}

/// RPC correlation token: either a counter value or a GUID.
///
/// This side issues `Seq` tokens; responders echo whatever type arrived.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    Seq(i64),
    Guid(Uuid),
}

impl Token {
    fn to_value(&self) -> Value {
        match self {
            Token::Seq(n) => Value::I64(*n),
            Token::Guid(g) => Value::Guid(*g),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::I64(n) => Some(Token::Seq(*n)),
            Value::Guid(g) => Some(Token::Guid(*g)),
            _ => None,
        }
    }
}

/// Handler the egress side registers to service Connect commands.
///
/// Resolves once the dial finished; the relay keeps running in its own
/// task afterwards.
pub type DialHandler = Box<
    dyn Fn(
            Arc<VirtualChannel>,
            String,
            u16,
            FrontProtocol,
        ) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send>>
        + Send
        + Sync,
>;

/// The processor living at channel id 0.
pub struct ControlChannel {
    mux: Weak<ChannelMux>,
    pending: Mutex<HashMap<Token, oneshot::Sender<VarMap>>>,
    next_token: AtomicI64,
    dialer: Mutex<Option<DialHandler>>,
}

impl ControlChannel {
    pub(crate) fn new(mux: Weak<ChannelMux>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicI64::new(1),
            dialer: Mutex::new(None),
        })
    }

    /// Register the Connect handler. Without one, Connect commands are
    /// answered with a failure callback.
    pub fn set_dialer(&self, dialer: DialHandler) {
        *self.dialer.lock() = Some(dialer);
    }

    fn issue_token(&self) -> Token {
        Token::Seq(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Ask the peer to allocate a channel id.
    pub async fn establish(&self, cancel: &CancellationToken) -> Result<i64, RpcError> {
        let (token, request) = request_map(self.issue_token(), Command::Establish)?;
        let response = self.call(token, &request, cancel).await?;
        match response.get::<i64>(KEY_DATA) {
            Some(cid) if cid > 0 => Ok(cid),
            Some(_) => Err(RpcError::Refused("peer could not allocate a channel".into())),
            None => Err(RpcError::Refused("establish reply carried no channel id".into())),
        }
    }

    /// Ask the peer to dial `host:port` and bind the flow to `cid`.
    pub async fn connect(
        &self,
        cid: i64,
        host: &str,
        port: u16,
        proto: FrontProtocol,
        cancel: &CancellationToken,
    ) -> Result<(), RpcError> {
        let (token, request) = request_map(self.issue_token(), Command::Connect)?;
        request.set(KEY_DATA, cid)?;
        request.set(KEY_HOST, host)?;
        request.set(KEY_PORT, i32::from(port))?;
        request.set(KEY_PROTO, proto.as_u8())?;

        let response = self.call(token, &request, cancel).await?;
        match response.get::<bool>(KEY_DATA) {
            Some(false) => Err(RpcError::Refused(format!("peer failed to reach {host}:{port}"))),
            _ => Ok(()),
        }
    }

    /// Tell the peer to close `cid`. Fire-and-forget.
    pub fn dispose(&self, cid: i64) -> Result<(), RpcError> {
        let (_token, request) = request_map(self.issue_token(), Command::Dispose)?;
        request.set(KEY_DATA, cid)?;
        self.submit(&request)
    }

    /// Send a request and await its callback.
    ///
    /// Cancelling removes the pending-reply slot; a late callback for the
    /// abandoned token is then silently dropped.
    pub async fn call(
        &self,
        token: Token,
        request: &VarMap,
        cancel: &CancellationToken,
    ) -> Result<VarMap, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token.clone(), tx);

        if let Err(e) = self.submit(request) {
            self.pending.lock().remove(&token);
            return Err(e);
        }

        tokio::select! {
            response = rx => response.map_err(|_| RpcError::SessionGone),
            _ = cancel.cancelled() => {
                self.pending.lock().remove(&token);
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Serialize and enqueue a control message on the priority queue.
    fn submit(&self, message: &VarMap) -> Result<(), RpcError> {
        let payload = message.serialize()?;
        let frame = Frame::new(CONTROL_CHANNEL_ID, Bytes::from(payload))?;
        let mux = self.mux.upgrade().ok_or(RpcError::SessionGone)?;
        mux.select_engine().enqueue_out_control(frame);
        Ok(())
    }

    /// Process one inbound control payload. Spawned by the multiplexer's
    /// dispatch so RPC work never head-of-line blocks data frames.
    pub(crate) async fn process(&self, payload: Bytes) {
        let message = match VarMap::deserialize(&payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable control message");
                return;
            }
        };

        let flag = message
            .get::<u8>(KEY_FLAG)
            .and_then(ControlFlag::from_u8)
            .unwrap_or(ControlFlag::Unset);

        match flag {
            ControlFlag::Callback => self.resolve_callback(message),
            ControlFlag::Control => self.handle_command(message).await,
            ControlFlag::Unset => {
                tracing::warn!("control message without a direction flag dropped");
            }
        }
    }

    fn resolve_callback(&self, message: VarMap) {
        let token = message.get_value(KEY_TOKEN).as_ref().and_then(Token::from_value);
        let Some(token) = token else {
            tracing::warn!("callback without a token dropped");
            return;
        };
        match self.pending.lock().remove(&token) {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => {
                tracing::trace!(?token, "callback for unknown token dropped");
            }
        }
    }

    async fn handle_command(&self, message: VarMap) {
        let token = message.get_value(KEY_TOKEN).as_ref().and_then(Token::from_value);
        let cmd = message.get::<u8>(KEY_COMMAND).and_then(Command::from_u8);

        match cmd {
            Some(Command::Establish) => self.handle_establish(token),
            Some(Command::Connect) => self.handle_connect(token, &message).await,
            Some(Command::Dispose) => self.handle_dispose(&message),
            other => {
                // Unrecognized commands are logged and not acknowledged.
                tracing::warn!(cmd = ?other, "unrecognized control command ignored");
            }
        }
    }

    fn handle_establish(&self, token: Option<Token>) {
        let cid = match self.mux.upgrade() {
            Some(mux) => mux.open_remote(),
            None => -1,
        };
        tracing::debug!(cid, "establish serviced");
        self.reply(token, Some(Value::I64(cid)));
    }

    async fn handle_connect(&self, token: Option<Token>, message: &VarMap) {
        let cid = message.get::<i64>(KEY_DATA);
        let host = message.get::<String>(KEY_HOST);
        let port = message
            .get::<i32>(KEY_PORT)
            .and_then(|p| u16::try_from(p).ok());
        let proto = message.get::<u8>(KEY_PROTO).and_then(FrontProtocol::from_u8);

        let (Some(cid), Some(host), Some(port), Some(proto)) = (cid, host, port, proto) else {
            tracing::warn!("connect command with missing or invalid fields");
            self.reply(token, Some(Value::Bool(false)));
            return;
        };

        let Some(mux) = self.mux.upgrade() else {
            self.reply(token, Some(Value::Bool(false)));
            return;
        };
        let Some(channel) = mux.channel(cid) else {
            tracing::warn!(cid, "connect for unknown channel");
            self.reply(token, Some(Value::Bool(false)));
            return;
        };

        let dial = {
            let guard = self.dialer.lock();
            guard
                .as_ref()
                .map(|d| d(channel.clone(), host.clone(), port, proto))
        };
        let Some(dial) = dial else {
            tracing::warn!(cid, "connect with no dialer registered");
            self.reply(token, Some(Value::Bool(false)));
            channel.close();
            return;
        };

        match dial.await {
            Ok(()) => {
                tracing::debug!(cid, host = %host, port, ?proto, "connect serviced");
                self.reply(token, None);
            }
            Err(e) => {
                tracing::warn!(cid, host = %host, port, error = %e, "dial failed");
                self.reply(token, Some(Value::Bool(false)));
                channel.close();
            }
        }
    }

    fn handle_dispose(&self, message: &VarMap) {
        let Some(cid) = message.get::<i64>(KEY_DATA) else {
            tracing::warn!("dispose command without a channel id");
            return;
        };
        if let Some(mux) = self.mux.upgrade() {
            if let Some(channel) = mux.channel(cid) {
                tracing::debug!(cid, "dispose serviced");
                channel.close();
            }
        }
    }

    /// Send a callback echoing `token`. A request without a token cannot be
    /// answered and is only logged.
    fn reply(&self, token: Option<Token>, data: Option<Value>) {
        let Some(token) = token else {
            tracing::warn!("request without a token cannot be answered");
            return;
        };
        let message = match callback_map(&token, data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "failed to build callback");
                return;
            }
        };
        if let Err(e) = self.submit(&message) {
            tracing::warn!(error = %e, "failed to submit callback");
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Build a request map carrying the reserved keys.
fn request_map(token: Token, cmd: Command) -> Result<(Token, VarMap), RpcError> {
    let map = VarMap::case_insensitive();
    map.set(KEY_TOKEN, token.to_value())?;
    map.set(KEY_COMMAND, cmd.as_u8())?;
    map.set(KEY_FLAG, ControlFlag::Control.as_u8())?;
    Ok((token, map))
}

/// Build a callback map echoing `token`.
fn callback_map(token: &Token, data: Option<Value>) -> Result<VarMap, MapError> {
    let map = VarMap::case_insensitive();
    map.set(KEY_TOKEN, token.to_value())?;
    map.set(KEY_COMMAND, Command::Unset.as_u8())?;
    map.set(KEY_FLAG, ControlFlag::Callback.as_u8())?;
    if let Some(data) = data {
        map.set(KEY_DATA, data)?;
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PortEngine, StreamLink};
    use std::time::Duration;
    use tokio::time::timeout;

    fn lone_mux() -> Arc<ChannelMux> {
        let (link, _peer) = StreamLink::pair();
        // Engines stay unstarted: enqueued control frames just sit in the
        // priority queue where the tests can inspect them.
        ChannelMux::new(vec![PortEngine::new(0, link)])
    }

    #[test]
    fn command_values_are_frozen() {
        assert_eq!(Command::Unset.as_u8(), 0);
        assert_eq!(Command::Establish.as_u8(), 1);
        assert_eq!(Command::Dispose.as_u8(), 2);
        assert_eq!(Command::Connect.as_u8(), 3);
        assert_eq!(Command::Request.as_u8(), 4);
        assert_eq!(Command::from_u8(3), Some(Command::Connect));
        assert_eq!(Command::from_u8(9), None);

        assert_eq!(ControlFlag::Control.as_u8(), 1);
        assert_eq!(ControlFlag::Callback.as_u8(), 2);

        assert_eq!(FrontProtocol::HttpConnect.as_u8(), 0);
        assert_eq!(FrontProtocol::Socks5.as_u8(), 5);
        assert_eq!(FrontProtocol::from_u8(5), Some(FrontProtocol::Socks5));
        assert_eq!(FrontProtocol::from_u8(1), None);
    }

    #[test]
    fn token_roundtrips_both_representations() {
        let seq = Token::Seq(42);
        assert_eq!(Token::from_value(&seq.to_value()), Some(seq));

        let guid = Token::Guid(Uuid::new_v4());
        assert_eq!(Token::from_value(&guid.to_value()), Some(guid));

        assert_eq!(Token::from_value(&Value::U8(1)), None);
    }

    #[test]
    fn request_map_carries_reserved_keys() {
        let (token, map) = request_map(Token::Seq(7), Command::Establish).unwrap();
        assert_eq!(token, Token::Seq(7));
        assert_eq!(map.get::<i64>(KEY_TOKEN), Some(7));
        assert_eq!(map.get::<u8>(KEY_COMMAND), Some(1));
        assert_eq!(map.get::<u8>(KEY_FLAG), Some(1));
        // Case-insensitive lookup of reserved keys.
        assert_eq!(map.get::<u8>("cmd"), Some(1));
    }

    #[tokio::test]
    async fn callback_resolves_pending_call() {
        let mux = lone_mux();
        let control = mux.control().clone();

        let (token, request) = request_map(Token::Seq(99), Command::Request).unwrap();
        let cancel = CancellationToken::new();
        let call_control = control.clone();
        let call = tokio::spawn(async move {
            call_control.call(token, &request, &cancel).await
        });

        // Wait for the pending slot to appear, then feed the callback.
        while control.pending_len() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let callback = callback_map(&Token::Seq(99), Some(Value::I64(5))).unwrap();
        control.process(Bytes::from(callback.serialize().unwrap())).await;

        let response = timeout(Duration::from_secs(5), call)
            .await
            .expect("call completes")
            .expect("task join")
            .expect("rpc ok");
        assert_eq!(response.get::<i64>(KEY_DATA), Some(5));
        assert_eq!(control.pending_len(), 0);
    }

    #[tokio::test]
    async fn guid_token_is_echoed_back() {
        let mux = lone_mux();
        let control = mux.control().clone();
        let guid = Uuid::new_v4();

        // A peer-issued request with a GUID token.
        let request = VarMap::case_insensitive();
        request.set(KEY_TOKEN, guid).unwrap();
        request.set(KEY_COMMAND, Command::Establish.as_u8()).unwrap();
        request.set(KEY_FLAG, ControlFlag::Control.as_u8()).unwrap();
        control.process(Bytes::from(request.serialize().unwrap())).await;

        // The callback sits on the control queue of the lone engine.
        let frame = mux.engines()[0].pop_outbound().expect("callback enqueued");
        assert_eq!(frame.channel_id, CONTROL_CHANNEL_ID);
        let callback = VarMap::deserialize(&frame.payload).unwrap();
        assert_eq!(callback.get::<u8>(KEY_FLAG), Some(ControlFlag::Callback.as_u8()));
        assert_eq!(callback.get::<Uuid>(KEY_TOKEN), Some(guid));
        // Establish allocated cid 1.
        assert_eq!(callback.get::<i64>(KEY_DATA), Some(1));
    }

    #[tokio::test]
    async fn cancellation_removes_pending_slot() {
        let mux = lone_mux();
        let control = mux.control().clone();

        let (token, request) = request_map(control.issue_token(), Command::Request).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = control.call(token, &request, &cancel).await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert_eq!(control.pending_len(), 0);
    }

    #[tokio::test]
    async fn unknown_callback_token_is_dropped() {
        let mux = lone_mux();
        let control = mux.control().clone();

        let callback = callback_map(&Token::Seq(12345), None).unwrap();
        control.process(Bytes::from(callback.serialize().unwrap())).await;
        assert_eq!(control.pending_len(), 0);
    }

    #[tokio::test]
    async fn unrecognized_command_is_not_acknowledged() {
        let mux = lone_mux();
        let control = mux.control().clone();

        let (_, request) = request_map(Token::Seq(1), Command::Request).unwrap();
        control.process(Bytes::from(request.serialize().unwrap())).await;
        assert!(mux.engines()[0].pop_outbound().is_none());
    }

    #[tokio::test]
    async fn connect_without_dialer_fails_and_closes() {
        let mux = lone_mux();
        let control = mux.control().clone();
        let cid = mux.open_remote();
        let channel = mux.channel(cid).unwrap();

        let (_, request) = request_map(Token::Seq(8), Command::Connect).unwrap();
        request.set(KEY_DATA, cid).unwrap();
        request.set(KEY_HOST, "example.com").unwrap();
        request.set(KEY_PORT, 443i32).unwrap();
        request.set(KEY_PROTO, FrontProtocol::HttpConnect.as_u8()).unwrap();
        control.process(Bytes::from(request.serialize().unwrap())).await;

        assert!(!channel.is_alive());
        // First outbound is the failure callback on the control queue.
        let frame = mux.engines()[0].pop_outbound().expect("failure callback");
        let callback = VarMap::deserialize(&frame.payload).unwrap();
        assert_eq!(callback.get::<bool>(KEY_DATA), Some(false));
    }
}
