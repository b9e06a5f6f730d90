//! Codec error kinds.

use core::fmt;

/// Errors from building or parsing frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Input ended before the header or the announced payload.
    Truncated { need: usize, have: usize },
    /// Payload exceeds the MTU.
    PayloadTooLarge { len: usize, max: usize },
    /// Header length field is negative or larger than the MTU.
    BadLength { len: i64 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { need, have } => {
                write!(f, "truncated frame: need {need} bytes, have {have}")
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload {len} bytes exceeds MTU {max}")
            }
            Self::BadLength { len } => write!(f, "bad header length field: {len}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Errors from the typed payload map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// Bad magic, bad version, unknown value tag, or an embedded length
    /// that violates the format limits.
    Malformed(&'static str),
    /// Input ended in the middle of an entry.
    Truncated,
    /// Key or value exceeds its size limit.
    BoundsExceeded {
        what: &'static str,
        len: usize,
        max: usize,
    },
    /// Key is empty or contains a NUL byte.
    InvalidKey(&'static str),
    /// Nesting would make the map graph reach itself.
    CycleDetected,
    /// Mutation attempted after `lock()`.
    ReadOnly,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed payload map: {msg}"),
            Self::Truncated => write!(f, "truncated payload map"),
            Self::BoundsExceeded { what, len, max } => {
                write!(f, "{what} too large: {len} bytes (max {max})")
            }
            Self::InvalidKey(msg) => write!(f, "invalid key: {msg}"),
            Self::CycleDetected => write!(f, "nested map cycle detected"),
            Self::ReadOnly => write!(f, "map is read-only"),
        }
    }
}

impl std::error::Error for MapError {}
