//! STX/ETX framing with DLE byte stuffing.
//!
//! On the wire a frame is `STX, stuffed(header ‖ payload), ETX`. Between the
//! delimiters every occurrence of a reserved octet is escaped as
//! `DLE, octet XOR 0xFF`; the XOR moves all three reserved values well away
//! from the reserved trio, so stuffed output never contains an unescaped
//! STX or ETX.

use bytes::{Buf, Bytes, BytesMut};

/// Frame begin delimiter.
pub const STX: u8 = 0x02;
/// Frame end delimiter.
pub const ETX: u8 = 0x03;
/// Escape byte.
pub const DLE: u8 = 0x10;

fn is_reserved(b: u8) -> bool {
    b == STX || b == ETX || b == DLE
}

/// Escape reserved octets, appending to `out`.
pub fn stuff_into(src: &[u8], out: &mut Vec<u8>) {
    for &b in src {
        if is_reserved(b) {
            out.push(DLE);
            out.push(b ^ 0xFF);
        } else {
            out.push(b);
        }
    }
}

/// Escape reserved octets into a fresh buffer.
pub fn stuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 8);
    stuff_into(src, &mut out);
    out
}

/// Undo byte stuffing.
///
/// A lone DLE at the end of the buffer is discarded; the decoder tolerates
/// truncated input and leaves resynchronization to the delimiter scanner.
pub fn unstuff(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b == DLE {
            if i + 1 >= src.len() {
                break;
            }
            out.push(src[i + 1] ^ 0xFF);
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    out
}

/// Bracket and stuff an encoded frame into `out`, replacing its contents.
///
/// `raw` is the unstuffed header-plus-payload from [`Frame::encode`]. The
/// buffer is cleared first so the sender loop can reuse one scratch
/// allocation per pass.
///
/// [`Frame::encode`]: crate::Frame::encode
pub fn pack_into(raw: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.push(STX);
    stuff_into(raw, out);
    out.push(ETX);
}

/// Streaming delimiter scanner.
///
/// Feed raw link bytes with [`push`](Self::push) and drain complete stuffed
/// frame bodies with [`next_body`](Self::next_body). Bytes before the first
/// STX are discarded; an STX without a closing ETX is retained for the next
/// read. A DLE-escaped pair never terminates a frame, so an escaped ETX
/// passes through intact.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: BytesMut,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received link bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete stuffed frame body (the octets between STX
    /// and ETX, exclusive), or `None` if no complete frame is buffered yet.
    pub fn next_body(&mut self) -> Option<Bytes> {
        let start = match self.buf.iter().position(|&b| b == STX) {
            Some(s) => s,
            None => {
                // No frame in sight; everything buffered is junk.
                self.buf.clear();
                return None;
            }
        };

        let mut i = start + 1;
        while i < self.buf.len() {
            match self.buf[i] {
                DLE => i += 2,
                ETX => {
                    self.buf.advance(start + 1);
                    let body = self.buf.split_to(i - start - 1).freeze();
                    self.buf.advance(1);
                    return Some(body);
                }
                _ => i += 1,
            }
        }

        // Incomplete frame: drop the junk prefix, keep from STX onward.
        self.buf.advance(start);
        None
    }

    /// Bytes currently held waiting for a frame to complete.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuff_escapes_all_reserved_octets() {
        let stuffed = stuff(&[STX, ETX, DLE]);
        assert_eq!(stuffed, vec![DLE, 0xFD, DLE, 0xFC, DLE, 0xEF]);
    }

    #[test]
    fn stuffed_output_has_no_unescaped_delimiters() {
        let src: Vec<u8> = (0u8..=255).collect();
        let stuffed = stuff(&src);
        let mut i = 0;
        while i < stuffed.len() {
            match stuffed[i] {
                DLE => i += 2,
                b => {
                    assert!(b != STX && b != ETX, "unescaped delimiter at {i}");
                    i += 1;
                }
            }
        }
        assert_eq!(unstuff(&stuffed), src);
    }

    #[test]
    fn unstuff_is_inverse_of_stuff() {
        let src = b"\x02hello\x10world\x03\x03\x03";
        assert_eq!(unstuff(&stuff(src)), src);
    }

    #[test]
    fn unstuff_discards_trailing_escape() {
        assert_eq!(unstuff(&[0x41, DLE]), vec![0x41]);
    }

    #[test]
    fn pack_brackets_and_stuffs() {
        let mut out = Vec::new();
        pack_into(&[0x01, STX, 0x02 ^ 0x01], &mut out);
        assert_eq!(out[0], STX);
        assert_eq!(*out.last().unwrap(), ETX);
        assert_eq!(unstuff(&out[1..out.len() - 1]), vec![0x01, STX, 0x03]);
    }

    #[test]
    fn scanner_yields_body_between_delimiters() {
        let mut sc = FrameScanner::new();
        sc.push(&[STX, 0x41, 0x42, ETX]);
        assert_eq!(sc.next_body().unwrap().as_ref(), &[0x41, 0x42]);
        assert_eq!(sc.next_body(), None);
    }

    #[test]
    fn scanner_discards_junk_before_stx() {
        let mut sc = FrameScanner::new();
        sc.push(&[0xAA, 0xBB, STX, 0x41, ETX]);
        assert_eq!(sc.next_body().unwrap().as_ref(), &[0x41]);
    }

    #[test]
    fn scanner_retains_incomplete_frame_across_pushes() {
        let mut sc = FrameScanner::new();
        sc.push(&[0x99, STX, 0x41]);
        assert_eq!(sc.next_body(), None);
        sc.push(&[0x42, ETX]);
        assert_eq!(sc.next_body().unwrap().as_ref(), &[0x41, 0x42]);
    }

    #[test]
    fn scanner_skips_escaped_etx() {
        let mut sc = FrameScanner::new();
        // DLE-escaped pair containing a raw ETX byte must not end the frame.
        sc.push(&[STX, DLE, ETX, 0x41, ETX]);
        assert_eq!(sc.next_body().unwrap().as_ref(), &[DLE, ETX, 0x41]);
    }

    #[test]
    fn scanner_handles_trailing_escape_at_buffer_end() {
        let mut sc = FrameScanner::new();
        sc.push(&[STX, 0x41, DLE]);
        assert_eq!(sc.next_body(), None);
        sc.push(&[0xFC, ETX]);
        assert_eq!(sc.next_body().unwrap().as_ref(), &[0x41, DLE, 0xFC]);
    }

    #[test]
    fn scanner_resyncs_across_garbage() {
        let mut f1 = Vec::new();
        pack_into(b"first", &mut f1);
        let mut f2 = Vec::new();
        pack_into(b"second", &mut f2);

        let mut stream = Vec::new();
        stream.extend_from_slice(&[0x00, 0x7F, 0x11]); // junk
        stream.extend_from_slice(&f1);
        stream.extend_from_slice(&[0xFF, 0xFE]); // garbage between frames
        stream.extend_from_slice(&f2);

        let mut sc = FrameScanner::new();
        sc.push(&stream);
        assert_eq!(unstuff(&sc.next_body().unwrap()), b"first");
        assert_eq!(unstuff(&sc.next_body().unwrap()), b"second");
        assert_eq!(sc.next_body(), None);
    }

    #[test]
    fn scanner_clears_pure_junk() {
        let mut sc = FrameScanner::new();
        sc.push(&[0xAA; 64]);
        assert_eq!(sc.next_body(), None);
        assert_eq!(sc.buffered(), 0);
    }
}
