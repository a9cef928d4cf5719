use std::net::SocketAddr;

use crate::{
    handshake::{self, HttpRequest, HEADER_TERMINATOR},
    transport::{Transport, MAX_HTTP_HEAD},
    Result,
};

use super::{Io, ReadHalf, Role, Settings, WebSocket};

/// Performs the server side of the handshake over a freshly accepted stream.
///
/// Requests that are not WebSocket upgrades get no response: the stream is shut down and the
/// error returned for the caller to log.
pub(crate) async fn upgrade<S: Io>(
    io: S,
    peer_addr: Option<SocketAddr>,
    settings: Settings,
) -> Result<(WebSocket, ReadHalf)> {
    let mut transport = Transport::new(io, settings.timeout);

    let head = transport
        .receive_until(HEADER_TERMINATOR, MAX_HTTP_HEAD)
        .await?;

    let accept = match HttpRequest::parse(&head).and_then(|req| {
        #[cfg(feature = "logging")]
        log::trace!("{} {} from {peer_addr:?}", req.method, req.path);
        handshake::accept_request(&req)
    }) {
        Ok(accept) => accept,
        Err(err) => {
            let _ = transport.disconnect().await;
            return Err(err);
        }
    };

    transport
        .send(handshake::switching_protocols(&accept).as_bytes())
        .await?;

    let (stream, leftover) = transport.into_parts();
    Ok(WebSocket::from_upgraded(
        Role::Server,
        stream,
        leftover,
        peer_addr,
        settings,
    ))
}
