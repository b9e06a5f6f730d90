//! The transport frame and its 16-byte wire header.

use bytes::Bytes;

use crate::FrameError;

/// Maximum payload bytes per frame.
pub const MTU: usize = 1400;

/// Wire header size: little-endian `i64` channel id + `i64` length.
pub const FRAME_HEADER_LEN: usize = 16;

/// Channel id reserved for the control channel.
pub const CONTROL_CHANNEL_ID: i64 = 0;

/// One logical transport unit: a channel id and up to [`MTU`] payload bytes.
///
/// An empty payload is the close signal for the frame's channel. A frame is
/// created at enqueue time and consumed once, on transmit or dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel_id: i64,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, rejecting payloads over the MTU.
    pub fn new(channel_id: i64, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MTU {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: MTU,
            });
        }
        Ok(Self {
            channel_id,
            payload,
        })
    }

    /// The empty-payload frame that signals close for `channel_id`.
    pub fn close_signal(channel_id: i64) -> Self {
        Self {
            channel_id,
            payload: Bytes::new(),
        }
    }

    /// True if this frame is a close signal.
    pub fn is_close_signal(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode header and payload (unstuffed) into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.encode_into(&mut out);
        out
    }

    /// Encode header and payload (unstuffed), appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel_id.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as i64).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    /// Parse an unstuffed buffer into a frame.
    ///
    /// The channel id is authoritative; the header length field is a
    /// redundancy check against the buffer. Trailing bytes beyond the
    /// announced length are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                need: FRAME_HEADER_LEN,
                have: buf.len(),
            });
        }
        let channel_id = i64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
        let len = i64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice"));
        if len < 0 || len as usize > MTU {
            return Err(FrameError::BadLength { len });
        }
        let len = len as usize;
        if buf.len() < FRAME_HEADER_LEN + len {
            return Err(FrameError::Truncated {
                need: FRAME_HEADER_LEN + len,
                have: buf.len(),
            });
        }
        Ok(Self {
            channel_id,
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len]),
        })
    }
}
