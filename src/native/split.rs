//! Read and write halves of an upgraded connection.
//!
//! The receive loop owns the [`ReadHalf`]. The [`WriteHalf`] is shared by every handle to the
//! connection; its mutex is the send lock, held for the whole frame write and flush so frames from
//! concurrent senders never interleave on the wire.
use std::{pin::Pin, time::Duration};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::{Decoder, Encoder},
    frame::Frame,
    transport::deadline,
    Result, WebSocketError,
};

use super::Role;

pub(crate) type DynRead = Pin<Box<dyn AsyncRead + Send>>;
pub(crate) type DynWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Incoming frames of a connection.
pub(crate) struct ReadHalf {
    frames: FramedRead<DynRead, Decoder>,
    timeout: Duration,
}

impl ReadHalf {
    /// `leftover` holds bytes that were read past the end of the HTTP head.
    pub(crate) fn new(
        stream: DynRead,
        leftover: BytesMut,
        max_payload_read: usize,
        timeout: Duration,
    ) -> Self {
        let mut frames = FramedRead::new(stream, Decoder::new(max_payload_read));
        frames.read_buffer_mut().extend_from_slice(&leftover);
        Self { frames, timeout }
    }

    /// Reads the next complete frame.
    ///
    /// A timeout leaves any partially received frame buffered; the next call picks it up.
    pub(crate) async fn next_frame(&mut self) -> Result<Frame> {
        let frames = &mut self.frames;
        deadline(self.timeout, async move {
            frames
                .next()
                .await
                .unwrap_or(Err(WebSocketError::TransportClosed))
        })
        .await
    }
}

/// Outgoing frames of a connection, behind the send lock.
pub(crate) struct WriteHalf {
    sink: Mutex<Option<FramedWrite<DynWrite, Encoder>>>,
    timeout: Duration,
}

impl WriteHalf {
    pub(crate) fn new(stream: DynWrite, role: Role, timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(Some(FramedWrite::new(stream, Encoder::new(role)))),
            timeout,
        }
    }

    /// Writes and flushes one frame while holding the send lock.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(WebSocketError::ConnectionClosed)?;
        deadline(self.timeout, sink.send(frame)).await
    }

    /// Shuts the transport down. Later sends fail with [`WebSocketError::ConnectionClosed`].
    pub(crate) async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            // the peer may already be gone
            let _ = deadline(self.timeout, async move { Ok(sink.close().await?) }).await;
        }
    }
}
