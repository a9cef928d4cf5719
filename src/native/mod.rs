mod builder;
mod options;
mod server;
mod split;
mod upgrade;

use std::{
    fmt,
    net::SocketAddr,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    frame::{Frame, OpCode},
    Result, WebSocketError, WsUrl,
};

pub use builder::{ClientBuilder, Io, Session};
pub use options::Options;
pub use server::WebSocketServer;

pub(crate) use options::Settings;
pub(crate) use split::{ReadHalf, WriteHalf};

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Payload of every keepalive ping. A pong carrying anything else closes the connection.
pub const PING_PAYLOAD: &[u8] = b"pingdata";

/// The role the WebSocket stream is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Lifecycle of a connection. It only ever moves forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Frames flow both ways.
    Open = 0,
    /// A local close is writing its Close frame.
    Closing = 1,
    /// The transport is shut down and the close callback has run.
    Closed = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

pub(crate) type MessageHandler = Arc<dyn Fn(Bytes, bool) + Send + Sync>;
pub(crate) type CloseHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Handlers {
    on_message: Option<MessageHandler>,
    on_close: Option<CloseHandler>,
    // set once terminate has taken the handlers out
    released: bool,
}

struct Shared {
    role: Role,
    state: AtomicU8,
    terminated: AtomicBool,
    peer_addr: Option<SocketAddr>,
    writer: WriteHalf,
    handlers: Mutex<Handlers>,
    cancel: CancellationToken,
    settings: Settings,
}

/// A handle to one upgraded WebSocket connection.
///
/// Handles are cheap to clone and can be moved to other tasks; all clones refer to the same
/// connection. Incoming frames are processed by a receive loop running on the connection's own
/// task, which answers pings, enforces the keepalive policy and hands text and binary payloads to
/// the callback registered with [`WebSocket::on_message`].
///
/// Connections are created by [`WebSocket::connect`] on the client side and by
/// [`WebSocketServer`] on the server side.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<Shared>,
}

impl WebSocket {
    /// Starts building a client connection to `url`.
    ///
    /// # Example
    /// ```no_run
    /// use wsengine::WebSocket;
    ///
    /// # async fn run() -> wsengine::Result<()> {
    /// WebSocket::connect("ws://127.0.0.1:9001/".parse()?)
    ///     .on_message(|payload, _| println!("{payload:?}"))
    ///     .run()
    ///     .await
    /// # }
    /// ```
    pub fn connect(url: WsUrl) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Wraps a stream whose HTTP upgrade already completed.
    ///
    /// `leftover` holds any bytes read past the end of the handshake; they are decoded before
    /// anything else read from `io`.
    pub(crate) fn from_upgraded<S>(
        role: Role,
        io: S,
        leftover: BytesMut,
        peer_addr: Option<SocketAddr>,
        settings: Settings,
    ) -> (WebSocket, ReadHalf)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let reader = ReadHalf::new(
            Box::pin(read),
            leftover,
            settings.max_payload_read,
            settings.timeout,
        );
        let writer = WriteHalf::new(Box::pin(write), role, settings.timeout);

        let ws = WebSocket {
            shared: Arc::new(Shared {
                role,
                state: AtomicU8::new(State::Open as u8),
                terminated: AtomicBool::new(false),
                peer_addr,
                writer,
                handlers: Mutex::default(),
                cancel: CancellationToken::new(),
                settings,
            }),
        };

        (ws, reader)
    }

    /// Registers the callback receiving every text and binary payload as `(payload, is_binary)`.
    ///
    /// The callback runs on the receive loop; it should hand long work off to another task.
    /// Registering again replaces the previous callback.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Bytes, bool) + Send + Sync + 'static,
    {
        self.set_message_handler(Arc::new(handler));
    }

    /// Registers the callback run once the connection is closed, whatever closed it.
    ///
    /// On a connection that is already closed the callback runs right away.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.set_close_handler(Box::new(handler));
    }

    pub(crate) fn set_message_handler(&self, handler: MessageHandler) {
        let mut handlers = self.handlers();
        if !handlers.released {
            handlers.on_message = Some(handler);
        }
    }

    pub(crate) fn set_close_handler(&self, handler: CloseHandler) {
        {
            let mut handlers = self.handlers();
            if !handlers.released {
                handlers.on_close = Some(handler);
                return;
            }
        }
        handler();
    }

    /// Sends `payload` as a single final text or binary frame.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] if the connection is not open. Any write failure
    /// closes the connection and is returned.
    pub async fn send(&self, payload: impl Into<Bytes>, is_binary: bool) -> Result<()> {
        let opcode = if is_binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };
        self.send_frame(Frame::new(true, opcode, None, payload)).await
    }

    /// Sends a text frame.
    pub async fn send_text(&self, text: impl AsRef<str>) -> Result<()> {
        self.send(Bytes::copy_from_slice(text.as_ref().as_bytes()), false)
            .await
    }

    /// Sends a binary frame.
    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(payload, true).await
    }

    /// Serializes `data` to JSON and sends it as a text frame.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub async fn send_json<T: serde::Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        self.send(bytes, false).await
    }

    /// Sends a keepalive ping carrying [`PING_PAYLOAD`].
    pub async fn ping(&self) -> Result<()> {
        self.send_frame(Frame::ping(PING_PAYLOAD)).await
    }

    /// Closes the connection.
    ///
    /// An empty Close frame is written, the transport is shut down, the receive loop stops and
    /// the close callback runs. Closing an already closed connection does nothing.
    ///
    /// # Errors
    /// Returns the error of writing the Close frame. The connection is closed either way.
    pub async fn close(&self) -> Result<()> {
        let opened = self.shared.state.compare_exchange(
            State::Open as u8,
            State::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if opened.is_err() {
            return Ok(());
        }

        let sent = self.write_frame(Frame::close(Bytes::new())).await;
        self.terminate().await;
        sent
    }

    /// Which side of the connection this handle is.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        State::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Returns `true` while frames can be sent.
    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    /// Address of the remote peer, when the connection runs over TCP.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Returns `true` if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &WebSocket) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(WebSocketError::ConnectionClosed);
        }
        self.write_frame(frame).await
    }

    /// Writes a frame regardless of the state. A failed write closes the connection.
    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let result = self.shared.writer.send(frame).await;
        if let Err(ref err) = result {
            #[cfg(feature = "logging")]
            log::debug!("{} send failed: {err}", self.shared.role);
            #[cfg(not(feature = "logging"))]
            let _ = err;
            self.terminate().await;
        }
        result
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the connection closed, shuts the transport down, stops the receive loop and runs the
    /// close callback. Only the first call has any effect.
    pub(crate) async fn terminate(&self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared
            .state
            .store(State::Closed as u8, Ordering::Release);
        self.shared.cancel.cancel();
        self.shared.writer.close().await;

        #[cfg(feature = "logging")]
        log::debug!(
            "{} connection to {:?} closed",
            self.shared.role,
            self.shared.peer_addr
        );

        // handlers often hold clones of this handle, dropping them breaks the cycle
        let (on_close, on_message) = {
            let mut handlers = self.handlers();
            handlers.released = true;
            (handlers.on_close.take(), handlers.on_message.take())
        };
        drop(on_message);
        if let Some(on_close) = on_close {
            on_close();
        }
    }

    /// Processes incoming frames until the connection ends, then terminates it.
    pub(crate) async fn receive_loop(self, mut reader: ReadHalf) {
        let cancel = self.shared.cancel.clone();

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = reader.next_frame() => result,
            };

            let flow = match result {
                Ok(frame) => self.on_frame(frame).await,
                Err(WebSocketError::Timeout) if self.shared.role == Role::Server => {
                    #[cfg(feature = "logging")]
                    log::trace!("idle connection to {:?}, pinging", self.shared.peer_addr);
                    self.keepalive().await
                }
                Err(err) => {
                    #[cfg(feature = "logging")]
                    log::debug!("{} receive failed: {err}", self.shared.role);
                    #[cfg(not(feature = "logging"))]
                    let _ = err;
                    ControlFlow::Break(())
                }
            };

            if flow.is_break() {
                break;
            }
        }

        self.terminate().await;
    }

    async fn on_frame(&self, frame: Frame) -> ControlFlow<()> {
        match frame.opcode {
            OpCode::Close => {
                // best effort, the connection is going away either way
                let _ = self.write_frame(Frame::close(Bytes::new())).await;
                ControlFlow::Break(())
            }
            _ if frame.is_masked() && self.shared.role == Role::Client => {
                #[cfg(feature = "logging")]
                log::debug!("server sent a masked frame");
                ControlFlow::Break(())
            }
            OpCode::Ping => match self.write_frame(Frame::pong(frame.payload)).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            },
            OpCode::Pong if frame.payload == PING_PAYLOAD => ControlFlow::Continue(()),
            OpCode::Pong => {
                #[cfg(feature = "logging")]
                log::debug!("unexpected pong payload {:?}", frame.payload);
                ControlFlow::Break(())
            }
            OpCode::Text | OpCode::Binary => {
                let is_binary = frame.opcode == OpCode::Binary;
                if !is_binary && self.shared.settings.check_utf8 && !frame.is_utf8() {
                    #[cfg(feature = "logging")]
                    log::debug!("{}", WebSocketError::InvalidUTF8);
                    return ControlFlow::Break(());
                }

                let on_message = self.handlers().on_message.clone();
                if let Some(on_message) = on_message {
                    on_message(frame.payload, is_binary);
                }

                match self.shared.role {
                    Role::Server => self.keepalive().await,
                    Role::Client => ControlFlow::Continue(()),
                }
            }
            OpCode::Continuation | OpCode::Reserved(_) => ControlFlow::Continue(()),
        }
    }

    async fn keepalive(&self) -> ControlFlow<()> {
        match self.write_frame(Frame::ping(PING_PAYLOAD)).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("peer_addr", &self.shared.peer_addr)
            .finish()
    }
}
