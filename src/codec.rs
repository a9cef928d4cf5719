//! Frame encoder and decoder for use with `tokio_util::codec` framed streams.
//!
//! The [`Decoder`] is incremental: whatever part of a frame is already buffered stays consumed
//! across calls, so a read that is interrupted (by a timeout, for instance) resumes exactly where
//! it stopped. A frame is only ever yielded once its whole payload has arrived.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_HEAD_SIZE},
    mask::apply_mask,
    Role, WebSocketError,
};

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The first two bytes were read, waiting for the extended length and mask.
    Header(Header),
    /// The whole header was read, waiting for the payload.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    /// Indicates if this is the final fragment in a message.
    fin: bool,
    /// Indicates if the frame is masked.
    masked: bool,
    /// The operation code of the frame.
    opcode: OpCode,
    /// Size of the extended length field, 0, 2 or 8 bytes.
    extra: usize,
    /// Encoded length of the payload.
    length_code: u8,
    /// Remaining header bytes after the first two.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A decoder for WebSocket frames, handling state transitions.
///
/// `Decoder` tracks the maximum allowed payload size and where it is within the current frame.
/// Masked payloads are unmasked in place; the key stays on the returned [`Frame`].
pub struct Decoder {
    /// Current reading state, `None` between frames.
    state: Option<ReadState>,
    /// Maximum allowed size for the frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` that rejects payloads larger than `max_payload_size` bytes.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            state: None,
            max_payload_size,
        }
    }

    /// Returns `true` while a frame has been started but not finished.
    fn in_frame(&self) -> bool {
        self.state.is_some()
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` once all parts of a frame are available.
    /// - `Ok(None)` if more data is needed.
    /// - `Err(WebSocketError)` on a protocol violation.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::from(src[0]);
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => u64::from(header.length_code),
                        2 => u64::from(src.get_u16()),
                        _ => src.get_u64(),
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() && !header.fin {
                        return Err(WebSocketError::ControlFrameFragmented);
                    }
                    if header.opcode.is_control() && payload_len > 125 {
                        return Err(WebSocketError::PingFrameTooLarge);
                    }

                    // lengths with the top bit set are invalid on the wire as well
                    let payload_len = match usize::try_from(payload_len) {
                        Ok(len) if payload_len <= i64::MAX as u64 && len <= self.max_payload_size => {
                            len
                        }
                        _ => return Err(WebSocketError::FrameTooLarge),
                    };

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        // reserve so the next read can pull the rest in one go
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let mut payload = src.split_to(payload_len);
                    if let Some(mask) = mask {
                        apply_mask(&mut payload, mask);
                    }

                    break Ok(Some(Frame::new(
                        header.fin,
                        header.opcode,
                        mask,
                        payload.freeze(),
                    )));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && !self.in_frame() => Ok(None),
            None => Err(WebSocketError::TransportClosed),
        }
    }
}

/// WebSocket frame encoder for serializing `Frame` instances into a buffer.
///
/// The encoder is role-aware. A client encoder masks every frame, drawing a fresh key from the
/// thread RNG when the frame does not carry one. A server encoder never masks.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates an encoder writing frames for the given side of the connection.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.mask = match self.role {
            Role::Client => Some(frame.mask.unwrap_or_else(rand::random)),
            Role::Server => None,
        };

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[start..], mask);
        }

        Ok(())
    }
}
