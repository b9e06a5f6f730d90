//! Engine and RPC error kinds.

use core::fmt;

use sermux_core::{FrameError, MapError};

/// Link-level failures.
#[derive(Debug)]
pub enum LinkError {
    /// The link or channel is closed.
    Closed,
    /// Underlying device I/O failed.
    Io(std::io::Error),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "link closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for LinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Control-channel RPC failures.
#[derive(Debug)]
pub enum RpcError {
    /// The request could not be submitted or the link died underneath it.
    Link(LinkError),
    /// A control message failed to serialize or deserialize.
    Payload(MapError),
    /// The request payload could not be framed.
    Frame(FrameError),
    /// The awaiting side was cancelled.
    Cancelled,
    /// The peer answered but declined the request.
    Refused(String),
    /// The multiplexer behind this control channel is gone.
    SessionGone,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(e) => write!(f, "link error: {e}"),
            Self::Payload(e) => write!(f, "payload error: {e}"),
            Self::Frame(e) => write!(f, "frame error: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Refused(msg) => write!(f, "refused: {msg}"),
            Self::SessionGone => write!(f, "session gone"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Link(e) => Some(e),
            Self::Payload(e) => Some(e),
            Self::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LinkError> for RpcError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<MapError> for RpcError {
    fn from(e: MapError) -> Self {
        Self::Payload(e)
    }
}

impl From<FrameError> for RpcError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

/// Front-end (SOCKS5 / HTTP-CONNECT) session failures.
#[derive(Debug)]
pub enum FrontError {
    Io(std::io::Error),
    Rpc(RpcError),
    /// The client spoke something we do not understand.
    Protocol(String),
}

impl fmt::Display for FrontError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Rpc(e) => write!(f, "tunnel error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for FrontError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrontError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<RpcError> for FrontError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}
