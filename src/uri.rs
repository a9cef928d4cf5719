//! Connection string parsing.
//!
//! A [`WsUrl`] is the decomposed form of `scheme://host[:port][/path][?query]`. Parsing is
//! deliberately lenient about the scheme: any scheme is accepted here, and the transport decides
//! later whether it knows how to reach it.
use std::{fmt, str::FromStr};

use crate::{Result, WebSocketError};

/// A parsed WebSocket endpoint.
///
/// ```rust
/// use wsengine::WsUrl;
///
/// let url: WsUrl = "wss://example.com/feed?id=3".parse().unwrap();
/// assert_eq!(url.host, "example.com");
/// assert_eq!(url.port, 443);
/// assert_eq!(url.request_target(), "/feed?id=3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WsUrl {
    /// Scheme without the `://` separator, e.g. `ws`.
    pub protocol: String,
    /// Host name or address. IPv6 literals are stored without brackets.
    pub host: String,
    /// Port, defaulting to 443 for `wss`/`https` and 80 otherwise.
    pub port: u16,
    /// Absolute path, `/` when absent.
    pub path: String,
    /// Query string including its leading `?`, empty when absent.
    pub query: String,
}

impl WsUrl {
    /// Splits a connection string into its components.
    ///
    /// # Errors
    /// [`WebSocketError::MalformedUrl`] when the `://` separator is missing, the host is empty or
    /// invalid, or the port is not a number in `0..=65535`.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = |reason: &str| WebSocketError::MalformedUrl(format!("{reason}: {input}"));

        let (protocol, rest) = input
            .split_once("://")
            .ok_or_else(|| malformed("missing scheme separator"))?;

        // fragments are never sent to the server
        let rest = rest.split_once('#').map_or(rest, |(before, _)| before);

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, target) = rest.split_at(authority_end);

        let (host, port) = split_authority(authority).ok_or_else(|| malformed("invalid authority"))?;
        if host.is_empty() {
            return Err(malformed("empty host"));
        }
        if url::Host::parse(host).is_err() && !is_ipv6(host) {
            return Err(malformed("invalid host"));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| malformed("invalid port"))?,
            None => default_port(protocol),
        };

        let (path, query) = match target.find('?') {
            Some(index) => target.split_at(index),
            None => (target, ""),
        };
        let path = if path.is_empty() { "/" } else { path };

        Ok(Self {
            protocol: protocol.to_owned(),
            host: host.to_owned(),
            port,
            path: path.to_owned(),
            query: query.to_owned(),
        })
    }

    /// Returns `true` when the scheme requires TLS.
    pub fn is_secure(&self) -> bool {
        is_secure(&self.protocol)
    }

    /// The port implied by the scheme when none is written out.
    pub fn default_port(&self) -> u16 {
        default_port(&self.protocol)
    }

    /// The request target of the upgrade request: path followed by the query.
    pub fn request_target(&self) -> String {
        format!("{}{}", self.path, self.query)
    }

    /// The value of the `Host` header, omitting the port when it is the scheme default.
    pub fn host_header(&self) -> String {
        let host = self.bracketed_host();
        if self.port == self.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    fn bracketed_host(&self) -> String {
        if is_ipv6(&self.host) {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl FromStr for WsUrl {
    type Err = WebSocketError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<url::Url> for WsUrl {
    type Error = WebSocketError;

    fn try_from(value: url::Url) -> Result<Self> {
        Self::parse(value.as_str())
    }
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}{}",
            self.protocol,
            self.bracketed_host(),
            self.port,
            self.path,
            self.query
        )
    }
}

fn is_secure(protocol: &str) -> bool {
    protocol.eq_ignore_ascii_case("wss") || protocol.eq_ignore_ascii_case("https")
}

fn default_port(protocol: &str) -> u16 {
    if is_secure(protocol) {
        443
    } else {
        80
    }
}

fn is_ipv6(host: &str) -> bool {
    host.parse::<std::net::Ipv6Addr>().is_ok()
}

/// Splits `host[:port]` or `[v6]:port` into its parts.
fn split_authority(authority: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        if !is_ipv6(host) {
            return None;
        }
        return match after {
            "" => Some((host, None)),
            _ => Some((host, Some(after.strip_prefix(':')?))),
        };
    }

    match authority.split_once(':') {
        Some((host, port)) => Some((host, Some(port))),
        None => Some((authority, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let url = WsUrl::parse("ws://example.com:8080/chat?room=1").unwrap();
        assert_eq!(url.protocol, "ws");
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/chat");
        assert_eq!(url.query, "?room=1");
        assert_eq!(url.request_target(), "/chat?room=1");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(WsUrl::parse("ws://a").unwrap().port, 80);
        assert_eq!(WsUrl::parse("http://a").unwrap().port, 80);
        assert_eq!(WsUrl::parse("wss://a").unwrap().port, 443);
        assert_eq!(WsUrl::parse("https://a").unwrap().port, 443);
        assert_eq!(WsUrl::parse("wss://a:9000").unwrap().port, 9000);
    }

    #[test]
    fn test_default_path_and_query() {
        let url = WsUrl::parse("ws://localhost").unwrap();
        assert_eq!(url.path, "/");
        assert_eq!(url.query, "");

        let url = WsUrl::parse("ws://localhost?x=1").unwrap();
        assert_eq!(url.path, "/");
        assert_eq!(url.query, "?x=1");
    }

    #[test]
    fn test_fragment_dropped() {
        let url = WsUrl::parse("ws://localhost/a?b=1#frag").unwrap();
        assert_eq!(url.path, "/a");
        assert_eq!(url.query, "?b=1");
    }

    #[test]
    fn test_ipv6_host() {
        let url = WsUrl::parse("ws://[::1]:9001/ws").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 9001);
        assert_eq!(url.host_header(), "[::1]:9001");
        assert_eq!(url.socket_address(), "[::1]:9001");
    }

    #[test]
    fn test_malformed() {
        for input in [
            "example.com/chat",
            "ws://",
            "ws://:80/",
            "ws://host:port/",
            "ws://host:70000/",
            "ws://[zz]:80/",
            "ws://bad host/",
        ] {
            assert!(
                matches!(WsUrl::parse(input), Err(WebSocketError::MalformedUrl(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_host_header() {
        assert_eq!(WsUrl::parse("ws://a/").unwrap().host_header(), "a");
        assert_eq!(WsUrl::parse("ws://a:81/").unwrap().host_header(), "a:81");
        assert_eq!(WsUrl::parse("wss://a:443/").unwrap().host_header(), "a");
        assert_eq!(WsUrl::parse("wss://a:80/").unwrap().host_header(), "a:80");
    }

    #[test]
    fn test_display_round_trip() {
        let url: WsUrl = "wss://example.com/feed?x=y".parse().unwrap();
        assert_eq!(url.to_string(), "wss://example.com:443/feed?x=y");
        assert_eq!(url.to_string().parse::<WsUrl>().unwrap(), url);
    }

    #[test]
    fn test_from_url() {
        let parsed = url::Url::parse("ws://127.0.0.1:3000/path").unwrap();
        let url = WsUrl::try_from(parsed).unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 3000);
        assert!(!url.is_secure());
    }
}
