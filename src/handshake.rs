//! HTTP/1.1 upgrade handshake.
//!
//! Both sides of the handshake exchange a single HTTP head terminated by an empty line. This
//! module builds those heads, parses the peer's head with `nom`, and validates the headers that
//! [RFC 6455 Section 4](https://datatracker.ietf.org/doc/html/rfc6455#section-4) requires.
//!
//! ```rust
//! use wsengine::handshake::compute_accept;
//!
//! assert_eq!(
//!     compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
//!     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
//! );
//! ```
use base64::prelude::*;
use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{char, digit1, line_ending, not_line_ending, space0, space1},
    combinator::{map, map_res, opt},
    multi::many0,
    sequence::{preceded, terminated},
    IResult, Parser,
};
use sha1::{Digest, Sha1};

use crate::{Result, WebSocketError, WsUrl};

/// GUID appended to the client key before hashing.
pub const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Marks the end of an HTTP head.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept(key: impl AsRef<[u8]>) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_ref());
    sha1.update(MAGIC_GUID.as_bytes());
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Builds the client's upgrade request for `url`.
pub fn client_request(url: &WsUrl, key: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key}\r\n\r\n",
        url.request_target(),
        url.host_header(),
    )
}

/// Builds the server's `101 Switching Protocols` response.
pub fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Header fields of an HTTP head, with names lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Looks up a header by name, ignoring case. A repeated header yields its last value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if the header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the head carried no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(name, value)` pairs in the order they were received.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.to_owned()))
                .collect(),
        )
    }
}

/// The status line and headers of a handshake response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
}

impl HttpResponse {
    /// Parses a response head, including its terminating empty line.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head).map_err(|_| WebSocketError::MalformedHttp)?;
        let (_, (status, headers)) =
            response_head(text).map_err(|_| WebSocketError::MalformedHttp)?;

        Ok(Self {
            status,
            headers: headers.into_iter().collect(),
        })
    }
}

/// The request line and headers of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
}

impl HttpRequest {
    /// Parses a request head, including its terminating empty line.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head).map_err(|_| WebSocketError::MalformedHttp)?;
        let (_, ((method, path), headers)) =
            request_head(text).map_err(|_| WebSocketError::MalformedHttp)?;

        Ok(Self {
            method: method.to_owned(),
            path: path.to_owned(),
            headers: headers.into_iter().collect(),
        })
    }
}

/// Validates the server's answer to an upgrade request sent with `key`.
///
/// The checks run in order: status `101`, `Upgrade: websocket`, `Connection: Upgrade`, then the
/// accept key. Header names are matched without regard to case, header values exactly.
pub fn verify_response(response: &HttpResponse, key: &str) -> Result<()> {
    if response.status != 101 {
        return Err(WebSocketError::InvalidStatusCode(response.status));
    }

    if response.headers.get("upgrade") != Some("websocket") {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if response.headers.get("connection") != Some("Upgrade") {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    match response.headers.get("sec-websocket-accept") {
        Some(accept) if accept == compute_accept(key) => Ok(()),
        _ => Err(WebSocketError::InvalidAcceptKey),
    }
}

/// Validates an upgrade request and returns the accept key to answer it with.
///
/// `Connection` has to be `upgrade` in any case.
pub fn accept_request(request: &HttpRequest) -> Result<String> {
    let upgrade = request
        .headers
        .get("connection")
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("upgrade"));
    if !upgrade {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let key = request
        .headers
        .get("sec-websocket-key")
        .ok_or(WebSocketError::MissingSecWebSocketKey)?;

    Ok(compute_accept(key))
}

type Header<'a> = (&'a str, &'a str);

fn is_token_char(c: char) -> bool {
    c.is_ascii_graphic()
        && !matches!(
            c,
            ':' | '(' | ')' | ',' | '/' | ';' | '<' | '=' | '>' | '?' | '@' | '[' | '\\' | ']' | '{'
                | '}' | '"'
        )
}

fn http_version(input: &str) -> IResult<&str, &str> {
    preceded(
        tag("HTTP/"),
        take_while1(|c: char| c.is_ascii_digit() || c == '.'),
    )
    .parse(input)
}

// HTTP/1.1 101 Switching Protocols
fn status_line(input: &str) -> IResult<&str, u16> {
    map(
        (
            http_version,
            space1,
            map_res(digit1, str::parse::<u16>),
            opt(preceded(space1, not_line_ending)),
            line_ending,
        ),
        |(_, _, status, _, _)| status,
    )
    .parse(input)
}

// GET /chat?room=1 HTTP/1.1
fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    map(
        (
            take_while1(is_token_char),
            space1,
            take_till1(|c: char| c.is_ascii_whitespace()),
            space1,
            http_version,
            line_ending,
        ),
        |(method, _, path, _, _, _)| (method, path),
    )
    .parse(input)
}

// Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
fn header_line(input: &str) -> IResult<&str, Header<'_>> {
    map(
        (
            take_while1(is_token_char),
            char(':'),
            space0,
            not_line_ending,
            line_ending,
        ),
        |(name, _, _, value, _): (&str, char, &str, &str, &str)| (name, value.trim_end()),
    )
    .parse(input)
}

fn response_head(input: &str) -> IResult<&str, (u16, Vec<Header<'_>>)> {
    terminated((status_line, many0(header_line)), line_ending).parse(input)
}

fn request_head(input: &str) -> IResult<&str, ((&str, &str), Vec<Header<'_>>)> {
    terminated((request_line, many0(header_line)), line_ending).parse(input)
}
