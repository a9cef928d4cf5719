//! Byte-stream transport with per-operation deadlines.
//!
//! [`connect`] opens the TCP (and, for secure schemes, TLS) connection for a [`WsUrl`].
//! [`Transport`] wraps any async byte stream with a read buffer so the handshake can read exactly
//! up to the end of the HTTP head; whatever arrived after it is handed on to the frame decoder
//! through [`Transport::into_parts`].
//!
//! Every operation is bounded by the transport's timeout and fails with one of three errors:
//! [`WebSocketError::Timeout`], [`WebSocketError::TransportClosed`] or
//! [`WebSocketError::TransportAborted`].
use std::{
    future::Future,
    sync::{Arc, OnceLock},
    time::Duration,
};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{self, pki_types::ServerName, ClientConfig},
    TlsConnector,
};

use crate::{stream::MaybeTlsStream, Result, WebSocketError, WsUrl};

/// Default deadline of every read and write, and the keepalive interval of server connections.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest HTTP head accepted while waiting for its terminating empty line.
pub const MAX_HTTP_HEAD: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

/// Runs `fut` under `duration`, turning an elapsed deadline into [`WebSocketError::Timeout`].
pub(crate) async fn deadline<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| WebSocketError::Timeout)?
}

/// Opens a connection to `url`, wrapping it in TLS for `wss://` and `https://`.
///
/// When `connector` is `None` a connector backed by the webpki root store is built on first
/// use and shared by every later secure connection.
pub async fn connect(
    url: &WsUrl,
    timeout: Duration,
    no_delay: bool,
    connector: Option<TlsConnector>,
) -> Result<MaybeTlsStream> {
    let secure = match url.protocol.to_ascii_lowercase().as_str() {
        "ws" | "http" => false,
        "wss" | "https" => true,
        _ => return Err(WebSocketError::InvalidHttpScheme),
    };

    let address = url.socket_address();
    let tcp_stream = deadline(timeout, async { Ok(TcpStream::connect(&address).await?) }).await?;
    tcp_stream.set_nodelay(no_delay)?;

    #[cfg(feature = "logging")]
    log::debug!("connected to {address} (tls={secure})");

    if !secure {
        return Ok(MaybeTlsStream::Plain(tcp_stream));
    }

    let connector = match connector {
        Some(connector) => connector,
        None => tls_connector()?,
    };
    let domain =
        ServerName::try_from(url.host.clone()).map_err(|_| WebSocketError::InvalidDnsName)?;

    let tls_stream = deadline(timeout, async {
        Ok(connector.connect(domain, tcp_stream).await?)
    })
    .await?;

    Ok(MaybeTlsStream::from(tls_stream))
}

/// Returns a connector trusting the webpki roots, with HTTP/1.1 ALPN.
///
/// The configuration is built once per process. If no crypto provider has been installed,
/// [*ring*](https://github.com/briansmith/ring) is used.
fn tls_connector() -> Result<TlsConnector> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    if let Some(config) = CONFIG.get() {
        return Ok(TlsConnector::from(Arc::clone(config)));
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    // a concurrent caller may have won the race, both configs are equivalent
    let config = CONFIG.get_or_init(|| Arc::new(config));
    Ok(TlsConnector::from(Arc::clone(config)))
}

/// A buffered byte stream whose operations all run under a deadline.
pub struct Transport<S> {
    stream: S,
    buffer: BytesMut,
    timeout: Duration,
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps `stream`, bounding every operation by `timeout`.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            timeout,
        }
    }

    /// The configured deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Bytes that were read from the stream but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Writes all of `data` and flushes it.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = &mut self.stream;
        deadline(self.timeout, async move {
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// Reads exactly `n` bytes.
    pub async fn receive(&mut self, n: usize) -> Result<BytesMut> {
        let Self {
            stream,
            buffer,
            timeout,
        } = self;

        deadline(*timeout, async move {
            while buffer.len() < n {
                fill(stream, buffer).await?;
            }
            Ok(buffer.split_to(n))
        })
        .await
    }

    /// Reads through the first occurrence of `delimiter` and returns everything up to and
    /// including it. Bytes after the delimiter stay buffered.
    ///
    /// An empty delimiter matches immediately and returns nothing.
    ///
    /// # Errors
    /// [`WebSocketError::HttpHeadTooLarge`] if `limit` bytes are buffered without a match.
    pub async fn receive_until(&mut self, delimiter: &[u8], limit: usize) -> Result<BytesMut> {
        if delimiter.is_empty() {
            return Ok(BytesMut::new());
        }

        let Self {
            stream,
            buffer,
            timeout,
        } = self;

        deadline(*timeout, async move {
            let mut scanned = 0;
            loop {
                if let Some(pos) = find(&buffer[scanned..], delimiter) {
                    return Ok(buffer.split_to(scanned + pos + delimiter.len()));
                }
                if buffer.len() >= limit {
                    return Err(WebSocketError::HttpHeadTooLarge(limit));
                }

                // the delimiter may straddle the previous and the next read
                scanned = buffer.len().saturating_sub(delimiter.len() - 1);
                fill(stream, buffer).await?;
            }
        })
        .await
    }

    pub async fn receive_u8(&mut self) -> Result<u8> {
        Ok(self.receive(1).await?.get_u8())
    }

    pub async fn receive_u16(&mut self) -> Result<u16> {
        Ok(self.receive(2).await?.get_u16())
    }

    pub async fn receive_u32(&mut self) -> Result<u32> {
        Ok(self.receive(4).await?.get_u32())
    }

    pub async fn receive_u64(&mut self) -> Result<u64> {
        Ok(self.receive(8).await?.get_u64())
    }

    /// Shuts down the write side of the stream.
    pub async fn disconnect(&mut self) -> Result<()> {
        let stream = &mut self.stream;
        deadline(self.timeout, async move { Ok(stream.shutdown().await?) }).await
    }

    /// Returns the stream and the bytes read past the last consumed position.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buffer)
    }
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buffer: &mut BytesMut) -> Result<()> {
    buffer.reserve(READ_CHUNK);
    match stream.read_buf(buffer).await? {
        0 => Err(WebSocketError::TransportClosed),
        _ => Ok(()),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
