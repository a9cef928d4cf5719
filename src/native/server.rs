use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::Result;

use super::{upgrade::upgrade, Options, WebSocket};

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type ConnectionHandler = Arc<dyn Fn(&WebSocket) + Send + Sync>;

/// The open server connections, keyed by an id assigned on upgrade.
#[derive(Default)]
struct SessionSet {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<u64, WebSocket>>,
}

impl SessionSet {
    fn insert(&self, ws: WebSocket) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, ws);
        id
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, WebSocket>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts WebSocket connections on a TCP listener.
///
/// Every accepted socket is upgraded on its own task. Requests that are not valid WebSocket
/// upgrades are dropped without a response. Each upgraded connection is handed to the
/// [`on_connection`](WebSocketServer::on_connection) callback, which typically registers the
/// connection's own callbacks, and then runs its receive loop on the same task.
///
/// The server is a cheap handle; clones share the listener and the session set.
///
/// # Example
/// ```no_run
/// use wsengine::WebSocketServer;
///
/// # async fn serve() -> wsengine::Result<()> {
/// let server = WebSocketServer::bind("127.0.0.1:9001")
///     .await?
///     .on_connection(|ws| {
///         println!("new connection from {:?}", ws.peer_addr());
///     });
///
/// let handle = server.spawn();
/// // ...
/// server.shutdown().await;
/// handle.await.ok();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WebSocketServer {
    listener: Arc<TcpListener>,
    options: Options,
    on_connection: Option<ConnectionHandler>,
    sessions: Arc<SessionSet>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    /// Binds a listener to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener))
    }

    /// Serves connections accepted by an existing listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener: Arc::new(listener),
            options: Options::default(),
            on_connection: None,
            sessions: Arc::default(),
            running: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Sets the options applied to every accepted connection.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Registers the callback invoked with each upgraded connection before its receive loop
    /// starts.
    pub fn on_connection<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WebSocket) + Send + Sync + 'static,
    {
        self.on_connection = Some(Arc::new(handler));
        self
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handles to the currently open connections.
    pub fn connections(&self) -> Vec<WebSocket> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Stops accepting and closes every open connection.
    ///
    /// Sockets still in the middle of their upgrade are dropped without a response.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for ws in self.connections() {
            let _ = ws.close().await;
        }
    }

    /// Accepts connections until [`shutdown`](WebSocketServer::shutdown) is called.
    ///
    /// Calling `run` while the server is already running returns immediately.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        if let Ok(addr) = self.listener.local_addr() {
            log::debug!("listening on {addr}");
        }

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(self.clone().serve(stream, peer_addr));
                }
                Err(err) => {
                    // accept errors are per connection (reset before accept, fd limits)
                    #[cfg(feature = "logging")]
                    log::error!("accept failed: {err}");
                    #[cfg(not(feature = "logging"))]
                    let _ = err;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        Ok(())
    }

    /// Runs the accept loop on a new task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    async fn serve(self, stream: TcpStream, peer_addr: SocketAddr) {
        let settings = self.options.settings();
        let _ = stream.set_nodelay(settings.no_delay);

        let upgraded = tokio::select! {
            _ = self.shutdown.cancelled() => {
                #[cfg(feature = "logging")]
                log::debug!("dropping {peer_addr}: server shutting down");
                return;
            }
            upgraded = upgrade(stream, Some(peer_addr), settings) => upgraded,
        };
        let (ws, reader) = match upgraded {
            Ok(upgraded) => upgraded,
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("dropping {peer_addr}: {err}");
                #[cfg(not(feature = "logging"))]
                let _ = err;
                return;
            }
        };

        #[cfg(feature = "logging")]
        log::debug!("upgraded connection from {peer_addr}");

        let id = self.sessions.insert(ws.clone());
        // shutdown may have run between the upgrade and the insert
        if self.shutdown.is_cancelled() {
            self.sessions.remove(id);
            let _ = ws.close().await;
            return;
        }
        if let Some(on_connection) = &self.on_connection {
            on_connection(&ws);
        }

        ws.receive_loop(reader).await;
        self.sessions.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_session_set_tracks_connections() {
        let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let session = WebSocket::connect(format!("ws://{addr}/").parse().unwrap())
            .await
            .unwrap();

        wait_for(|| server.connection_count() == 1).await;
        let remote = server.connections().remove(0);
        assert_eq!(remote.role(), crate::Role::Server);
        assert!(remote.peer_addr().is_some());
        assert_eq!(session.peer_addr(), Some(addr));

        session.close().await.unwrap();
        wait_for(|| server.connection_count() == 0).await;

        server.shutdown().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_non_upgrade_request_dropped() {
        let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert!(response.is_empty());
        assert_eq!(server.connection_count(), 0);

        server.shutdown().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_upgrades() {
        let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\n")
            .await
            .unwrap();
        // let the accept loop hand the socket to its upgrade task
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.shutdown().await;
        handle.await.unwrap().unwrap();

        let _ = stream
            .write_all(b"Upgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n")
            .await;

        let mut response = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
            .await
            .unwrap();
        assert!(read.is_err() || response.is_empty());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
        let handle = server.spawn();
        wait_for(|| server.running.load(Ordering::Acquire)).await;

        // a second run returns immediately while the first one is active
        server.run().await.unwrap();

        server.shutdown().await;
        handle.await.unwrap().unwrap();
        assert!(!server.running.load(Ordering::Acquire));
    }
}
