use std::{
    future::IntoFuture,
    net::SocketAddr,
    ops::Deref,
    sync::Arc,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tokio_rustls::TlsConnector;

use crate::{
    handshake::{self, HttpResponse, HEADER_TERMINATOR},
    transport::{self, Transport, MAX_HTTP_HEAD},
    Result, WsUrl,
};

use super::{CloseHandler, MessageHandler, Options, ReadHalf, Role, Settings, WebSocket};

/// Byte streams a client handshake can run over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type that can move between tasks.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type OpenHandler = Box<dyn FnOnce(&WebSocket) + Send>;

/// Builder for client connections.
///
/// Created by [`WebSocket::connect`]. The connection is established by [`ClientBuilder::run`],
/// which drives it to completion on the current task, or by [`ClientBuilder::spawn`] (and
/// `.await` on the builder itself), which moves the receive loop to a new task and returns a
/// [`Session`].
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use wsengine::{Options, WebSocket};
///
/// async fn connect_example() -> wsengine::Result<()> {
///     let session = WebSocket::connect("wss://example.com/socket".parse()?)
///         .with_options(Options::default().with_timeout(Duration::from_secs(30)))
///         .on_open(|ws| println!("connected to {:?}", ws.peer_addr()))
///         .on_message(|payload, _| println!("{} bytes", payload.len()))
///         .await?;
///
///     session.send_text("subscribe").await?;
///     session.join().await;
///     Ok(())
/// }
/// ```
pub struct ClientBuilder {
    url: WsUrl,
    options: Options,
    stream: Option<Box<dyn Io>>,
    connector: Option<TlsConnector>,
    on_open: Option<OpenHandler>,
    on_message: Option<MessageHandler>,
    on_close: Option<CloseHandler>,
}

impl ClientBuilder {
    pub(super) fn new(url: WsUrl) -> Self {
        Self {
            url,
            options: Options::default(),
            stream: None,
            connector: None,
            on_open: None,
            on_message: None,
            on_close: None,
        }
    }

    /// Sets the connection options.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Runs the handshake over an already connected stream instead of dialing the URL.
    ///
    /// The URL still provides the request target and the `Host` header.
    pub fn with_stream<S: Io>(mut self, stream: S) -> Self {
        self.stream = Some(Box::new(stream));
        self
    }

    /// Sets a custom TLS connector for `wss://` connections.
    pub fn with_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Registers a callback invoked with the live connection right after the handshake, before
    /// any frame is read.
    pub fn on_open<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&WebSocket) + Send + 'static,
    {
        self.on_open = Some(Box::new(handler));
        self
    }

    /// See [`WebSocket::on_message`].
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes, bool) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// See [`WebSocket::on_close`].
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(handler));
        self
    }

    /// Connects, performs the handshake and runs the receive loop until the connection closes.
    ///
    /// # Errors
    /// Connection and handshake failures. Once the connection is established this only returns
    /// `Ok`, when the connection has closed.
    pub async fn run(mut self) -> Result<()> {
        let (ws, reader) = self.open().await?;
        ws.receive_loop(reader).await;
        Ok(())
    }

    /// Connects and performs the handshake, then runs the receive loop on a new task.
    pub async fn spawn(mut self) -> Result<Session> {
        let (ws, reader) = self.open().await?;
        let task = tokio::spawn(ws.clone().receive_loop(reader));
        Ok(Session { socket: ws, task })
    }

    async fn open(&mut self) -> Result<(WebSocket, ReadHalf)> {
        let settings = self.options.settings();

        let (ws, reader) = match self.stream.take() {
            Some(stream) => client_handshake(&self.url, stream, None, settings).await?,
            None => {
                let stream = transport::connect(
                    &self.url,
                    settings.timeout,
                    settings.no_delay,
                    self.connector.take(),
                )
                .await?;
                let peer_addr = stream.peer_addr().ok();
                client_handshake(&self.url, stream, peer_addr, settings).await?
            }
        };

        #[cfg(feature = "logging")]
        log::debug!("connected to {}", self.url);

        if let Some(on_message) = self.on_message.take() {
            ws.set_message_handler(on_message);
        }
        if let Some(on_close) = self.on_close.take() {
            ws.set_close_handler(on_close);
        }
        if let Some(on_open) = self.on_open.take() {
            on_open(&ws);
        }

        Ok((ws, reader))
    }
}

impl IntoFuture for ClientBuilder {
    type Output = Result<Session>;
    type IntoFuture = BoxFuture<'static, Result<Session>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.spawn())
    }
}

/// Sends the upgrade request over `stream` and validates the answer.
async fn client_handshake<S: Io>(
    url: &WsUrl,
    stream: S,
    peer_addr: Option<SocketAddr>,
    settings: Settings,
) -> Result<(WebSocket, ReadHalf)> {
    let mut transport = Transport::new(stream, settings.timeout);

    let key = handshake::generate_key();
    let request = handshake::client_request(url, &key);
    transport.send(request.as_bytes()).await?;

    let head = transport
        .receive_until(HEADER_TERMINATOR, MAX_HTTP_HEAD)
        .await?;
    let response = HttpResponse::parse(&head)?;
    if let Err(err) = handshake::verify_response(&response, &key) {
        #[cfg(feature = "logging")]
        log::debug!("handshake with {url} rejected: {err}");
        return Err(err);
    }

    let (stream, leftover) = transport.into_parts();
    Ok(WebSocket::from_upgraded(
        Role::Client,
        stream,
        leftover,
        peer_addr,
        settings,
    ))
}

/// A client connection whose receive loop runs on its own task.
///
/// Dereferences to the [`WebSocket`] handle. Dropping a `Session` detaches the task; the
/// connection keeps running until it closes.
pub struct Session {
    socket: WebSocket,
    task: JoinHandle<()>,
}

impl Session {
    /// Waits for the connection to close.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            if err.is_panic() {
                std::panic::resume_unwind(err.into_panic());
            }
        }
    }

    /// Returns the connection handle, leaving the receive loop running in the background.
    pub fn detach(self) -> WebSocket {
        self.socket
    }

    /// Returns `true` once the receive loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Deref for Session {
    type Target = WebSocket;

    fn deref(&self) -> &Self::Target {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::{
        frame::OpCode,
        handshake::{compute_accept, switching_protocols, HttpRequest},
        WebSocketError,
    };

    fn url() -> WsUrl {
        "ws://example.com/chat".parse().unwrap()
    }

    async fn read_request(server: &mut DuplexStream) -> HttpRequest {
        let mut transport = Transport::new(server, Duration::from_secs(1));
        let head = transport
            .receive_until(HEADER_TERMINATOR, MAX_HTTP_HEAD)
            .await
            .unwrap();
        HttpRequest::parse(&head).unwrap()
    }

    async fn answer(response: String) -> Result<Session> {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let _ = read_request(&mut server).await;
            server.write_all(response.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        WebSocket::connect(url()).with_stream(client).spawn().await
    }

    #[tokio::test]
    async fn test_handshake_and_first_frame() {
        let (client, mut server) = duplex(4096);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let opened = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&opened);

        let server_task = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            assert_eq!(request.path, "/chat");
            assert_eq!(request.headers.get("host"), Some("example.com"));
            assert_eq!(request.headers.get("upgrade"), Some("websocket"));
            assert_eq!(request.headers.get("sec-websocket-version"), Some("13"));

            let key = request.headers.get("sec-websocket-key").unwrap();
            let mut response = switching_protocols(&compute_accept(key)).into_bytes();
            // a frame in the same segment as the response
            response.extend_from_slice(&[0x81, 0x05]);
            response.extend_from_slice(b"hello");
            server.write_all(&response).await.unwrap();
            server
        });

        let session = WebSocket::connect(url())
            .with_stream(client)
            .on_open(move |ws| flag.store(ws.role() == Role::Client, Ordering::SeqCst))
            .on_message(move |payload, is_binary| {
                let _ = tx.send((payload, is_binary));
            })
            .await
            .unwrap();

        assert!(opened.load(Ordering::SeqCst));
        let (payload, is_binary) = rx.recv().await.unwrap();
        assert_eq!(payload, "hello");
        assert!(!is_binary);

        let mut server = server_task.await.unwrap();
        session.send_text("reply").await.unwrap();

        let mut head = [0u8; 6];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x81);
        assert_eq!(head[1], 0x80 | 5);
        let mut payload = [0u8; 5];
        server.read_exact(&mut payload).await.unwrap();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= head[2 + i % 4];
        }
        assert_eq!(&payload, b"reply");
        assert_eq!(OpCode::from(head[0]), OpCode::Text);
    }

    #[tokio::test]
    async fn test_rejects_non_101() {
        let result = answer("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".into()).await;
        assert!(matches!(result, Err(WebSocketError::InvalidStatusCode(200))));
    }

    #[tokio::test]
    async fn test_rejects_wrong_accept() {
        let result = answer(switching_protocols(&compute_accept("some other key"))).await;
        match result {
            Err(err) => {
                assert!(err.is_handshake());
                assert!(matches!(err, WebSocketError::InvalidAcceptKey));
            }
            Ok(_) => panic!("handshake should fail"),
        }
    }

    #[tokio::test]
    async fn test_rejects_lowercase_connection() {
        let result = answer(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: upgrade\r\n\r\n"
                .into(),
        )
        .await;
        assert!(matches!(result, Err(WebSocketError::InvalidConnectionHeader)));
    }

    #[tokio::test]
    async fn test_peer_closing_during_handshake() {
        let (client, server) = duplex(4096);
        drop(server);

        let result = WebSocket::connect(url()).with_stream(client).run().await;
        assert!(matches!(
            result,
            Err(WebSocketError::TransportClosed) | Err(WebSocketError::TransportAborted(_))
        ));
    }
}
