//! # wsengine
//! Implementation of the WebSocket protocol (RFC 6455) for both ends of a connection: the HTTP
//! upgrade handshake, the binary frame format with client-side masking, and a keepalive-aware
//! receive loop that drives application callbacks.
//!
//! Each connection is owned by one task. Reads and writes are bounded by a per-operation timeout
//! (15 seconds unless configured otherwise), and that timeout doubles as the keepalive trigger on
//! the server side: an idle server connection sends a ping instead of giving up.
//!
//! # Features
//! - `logging`: debug logging of handshakes, keepalive decisions and connection teardown through the
//!   `log` crate. Enabled by default.
//! - `simd`: validates UTF-8 text frames with `simdutf8` when [`Options::with_utf8`] is set.
//! - `json`: adds [`WebSocket::send_json`].
//!
//! # Client Example
//! ```no_run
//! use wsengine::WebSocket;
//!
//! #[tokio::main]
//! async fn main() -> wsengine::Result<()> {
//!     let session = WebSocket::connect("ws://127.0.0.1:8080/chat".parse()?)
//!         .on_message(|payload, is_binary| {
//!             println!("received {} bytes (binary={is_binary})", payload.len());
//!         })
//!         .on_close(|| println!("closed"))
//!         .spawn()
//!         .await?;
//!
//!     session.send_text("hello").await?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use wsengine::WebSocketServer;
//!
//! #[tokio::main]
//! async fn main() -> wsengine::Result<()> {
//!     let server = WebSocketServer::bind("0.0.0.0:8080")
//!         .await?
//!         .on_connection(|ws| {
//!             let echo = ws.clone();
//!             ws.on_message(move |payload, is_binary| {
//!                 let echo = echo.clone();
//!                 tokio::spawn(async move {
//!                     let _ = echo.send(payload, is_binary).await;
//!                 });
//!             });
//!         });
//!
//!     server.run().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

mod native;

pub mod codec;
pub mod frame;
pub mod handshake;
mod mask;
mod stream;
pub mod transport;
pub mod uri;

use std::io;

use thiserror::Error;

pub use bytes::Bytes;
pub use native::*;
pub use stream::MaybeTlsStream;
pub use uri::WsUrl;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into four groups:
///
/// - Transport failures (`Timeout`, `TransportClosed`, `TransportAborted`). They drive the
///   receive loop's policy: a timeout is a keepalive trigger for servers and fatal for clients,
///   everything else terminates the connection.
/// - Handshake failures, returned synchronously to whoever initiated the connection. See
///   [`WebSocketError::is_handshake`].
/// - Frame violations detected while decoding untrusted input.
/// - Usage errors such as sending on a closed connection or passing a malformed URL.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// No data was transferred within the configured deadline.
    #[error("Operation timed out")]
    Timeout,

    /// The peer closed the byte stream, possibly in the middle of a frame.
    #[error("Transport closed by peer")]
    TransportClosed,

    /// The connection was reset or failed at the network level.
    #[error("Transport aborted: {0}")]
    TransportAborted(#[source] io::Error),

    /// The server answered the upgrade request with something other than `101`.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The "Upgrade" header of the handshake response is missing or is not `websocket`.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The "Connection" header is missing or does not carry the `Upgrade` token.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The "Sec-WebSocket-Accept" header is missing or does not match the key we sent.
    #[error("Sec-WebSocket-Accept does not match the computed key")]
    InvalidAcceptKey,

    /// The upgrade request has no "Sec-WebSocket-Key" header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The HTTP head of a handshake could not be parsed.
    #[error("Malformed HTTP head")]
    MalformedHttp,

    /// The HTTP head grew past the accepted size without a terminating blank line.
    #[error("HTTP head exceeds {0} bytes")]
    HttpHeadTooLarge(usize),

    /// The connection string is not of the form `scheme://host[:port][/path][?query]`.
    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    /// The URL scheme is not one of `ws`, `wss`, `http` or `https`.
    #[error("Invalid URL scheme")]
    InvalidHttpScheme,

    /// The host of a `wss://` URL is not a valid server name for TLS.
    #[error("Invalid DNS name")]
    InvalidDnsName,

    /// Errors raised while building the TLS client configuration.
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),

    /// Returned when attempting to send on a connection that is already closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// One of the three reserved bits of a frame header is set.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (ping, pong or close) arrived without the FIN bit.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame (ping, pong or close) carried more than 125 bytes of payload.
    #[error("Control frame too large")]
    PingFrameTooLarge,

    /// A frame payload exceeds the configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// A text frame carried invalid UTF-8 while validation was enabled.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// Returns `true` for errors caused by a rejected or malformed upgrade handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::InvalidStatusCode(_)
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::InvalidAcceptKey
                | Self::MissingSecWebSocketKey
                | Self::MalformedHttp
                | Self::HttpHeadTooLarge(_)
        )
    }

    /// Returns `true` if the error is a transport-level failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::TransportClosed | Self::TransportAborted(_)
        )
    }
}

impl From<io::Error> for WebSocketError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::UnexpectedEof => Self::TransportClosed,
            _ => Self::TransportAborted(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let timeout = WebSocketError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(timeout, WebSocketError::Timeout));

        let closed = WebSocketError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(closed, WebSocketError::TransportClosed));

        let aborted = WebSocketError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(aborted, WebSocketError::TransportAborted(_)));
        assert!(aborted.is_transport());
    }

    #[test]
    fn test_handshake_classification() {
        assert!(WebSocketError::InvalidStatusCode(200).is_handshake());
        assert!(WebSocketError::InvalidAcceptKey.is_handshake());
        assert!(WebSocketError::MissingSecWebSocketKey.is_handshake());
        assert!(!WebSocketError::Timeout.is_handshake());
        assert!(!WebSocketError::MalformedUrl("x".into()).is_handshake());
    }
}
