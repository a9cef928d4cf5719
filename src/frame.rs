//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! Each frame is one atomic unit on the wire: a small header carrying the opcode, the FIN bit,
//! the masking flag and the payload length, followed by the (optionally masked) payload.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! A [`Frame`] always holds its payload in plain form. The masking key only describes how the
//! payload travels on the wire: the [`Encoder`](crate::codec::Encoder) applies it while writing
//! and the [`Decoder`](crate::codec::Decoder) removes it while reading, keeping the key on the
//! frame so callers can tell that the peer masked it.
//!
//! ```rust
//! use wsengine::frame::{Frame, OpCode};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! assert_eq!(text.opcode, OpCode::Text);
//! assert!(text.fin);
//!
//! let ping = Frame::ping("pingdata");
//! assert!(ping.opcode.is_control());
//! ```
use bytes::Bytes;

/// WebSocket operation code (OpCode) that determines the semantic meaning of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved. They decode to [`OpCode::Reserved`] so that a
/// frame carrying one can still be read off the wire and skipped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame.
    ///
    /// Control frames have the high bit of the opcode nibble set. They cannot be fragmented and,
    /// for pings, carry at most 125 bytes of payload.
    pub fn is_control(&self) -> bool {
        u8::from(*self) & 0x08 != 0
    }

    /// Returns `true` for the two opcodes that carry application data.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl From<u8> for OpCode {
    /// Interprets the low nibble of `value` as an opcode.
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(code) => code & 0x0F,
        }
    }
}

/// Largest possible header: 2 fixed bytes, 8 bytes of extended length and a 4 byte mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// A single WebSocket frame.
///
/// # Fields
/// - `fin`: Final fragment flag. Frames produced by this crate always set it.
/// - `opcode`: Defines the frame type.
/// - `mask`: Wire masking key. Set on frames received masked and on frames a client sends.
/// - `payload`: Unmasked payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key for the frame, if any.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload of the frame, never masked in memory.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new WebSocket `Frame`.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a ping frame carrying `payload`.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame carrying `payload`.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate if `payload` is a valid close frame payload.
    pub fn close(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Sets the masking key used when this frame is written by a client.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Returns the masking key, if any.
    #[inline(always)]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    /// Returns whether the frame is masked on the wire.
    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        #[cfg(feature = "simd")]
        {
            simdutf8::basic::from_utf8(&self.payload).is_ok()
        }
        #[cfg(not(feature = "simd"))]
        {
            std::str::from_utf8(&self.payload).is_ok()
        }
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod opcode_tests {
        use super::*;

        #[test]
        fn test_is_control() {
            assert!(OpCode::Close.is_control());
            assert!(OpCode::Ping.is_control());
            assert!(OpCode::Pong.is_control());
            assert!(OpCode::Reserved(0xB).is_control());

            assert!(!OpCode::Continuation.is_control());
            assert!(!OpCode::Text.is_control());
            assert!(!OpCode::Binary.is_control());
            assert!(!OpCode::Reserved(0x3).is_control());
        }

        #[test]
        fn test_from_u8() {
            assert_eq!(OpCode::from(0x0), OpCode::Continuation);
            assert_eq!(OpCode::from(0x1), OpCode::Text);
            assert_eq!(OpCode::from(0x2), OpCode::Binary);
            assert_eq!(OpCode::from(0x8), OpCode::Close);
            assert_eq!(OpCode::from(0x9), OpCode::Ping);
            assert_eq!(OpCode::from(0xA), OpCode::Pong);

            for code in [0x3, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
                assert_eq!(OpCode::from(code), OpCode::Reserved(code));
                assert_eq!(u8::from(OpCode::from(code)), code);
            }
        }

        #[test]
        fn test_from_u8_ignores_high_nibble() {
            assert_eq!(OpCode::from(0x81), OpCode::Text);
        }
    }

    mod frame_tests {
        use super::*;

        fn head_of(len: usize, mask: Option<[u8; 4]>) -> (usize, [u8; MAX_HEAD_SIZE]) {
            let frame = Frame::new(true, OpCode::Binary, mask, vec![0u8; len]);
            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);
            (size, head)
        }

        #[test]
        fn test_constructors_are_final() {
            for frame in [
                Frame::text("a"),
                Frame::binary(vec![1]),
                Frame::ping("p"),
                Frame::pong("p"),
                Frame::close(Bytes::new()),
            ] {
                assert!(frame.fin);
                assert!(!frame.is_masked());
            }
        }

        #[test]
        fn test_frame_is_utf8() {
            assert!(Frame::text("Hello, 世界").is_utf8());
            assert!(!Frame::text(vec![0xFF, 0xFE, 0xFD]).is_utf8());
        }

        #[test]
        fn test_fmt_head_masked() {
            let mask_key = [0xAA, 0xBB, 0xCC, 0xDD];
            let frame = Frame::text("Header test").with_mask(mask_key);

            let mut head = [0u8; MAX_HEAD_SIZE];
            let size = frame.fmt_head(&mut head);

            assert_eq!(size, 2 + 4);
            assert_eq!(head[0], 0x81);
            assert_eq!(head[1], 0x80 | 11);
            assert_eq!(&head[2..6], &mask_key);
        }

        #[test]
        fn test_fmt_head_length_boundaries() {
            let (size, head) = head_of(125, None);
            assert_eq!(size, 2);
            assert_eq!(head[1], 125);

            let (size, head) = head_of(126, None);
            assert_eq!(size, 4);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &126u16.to_be_bytes());

            let (size, head) = head_of(65535, None);
            assert_eq!(size, 4);
            assert_eq!(head[1], 126);
            assert_eq!(&head[2..4], &[0xFF, 0xFF]);

            let (size, head) = head_of(65536, Some([1, 2, 3, 4]));
            assert_eq!(size, 14);
            assert_eq!(head[1], 0x80 | 127);
            assert_eq!(&head[2..10], &65536u64.to_be_bytes());
            assert_eq!(&head[10..14], &[1, 2, 3, 4]);
        }

        #[test]
        fn test_fmt_head_non_final() {
            let frame = Frame::new(false, OpCode::Continuation, None, "x");
            let mut head = [0u8; MAX_HEAD_SIZE];
            frame.fmt_head(&mut head);
            assert_eq!(head[0], 0x00);
        }
    }
}
