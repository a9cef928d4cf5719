use std::time::Duration;

use crate::transport::DEFAULT_TIMEOUT;

use super::MAX_PAYLOAD_READ;

/// Configuration options for a WebSocket connection.
///
/// `Options` sets the parameters that govern a connection: the read/write deadline (which is
/// also the keepalive interval of server connections), payload size limits and UTF-8 validation.
///
/// ```rust
/// use std::time::Duration;
/// use wsengine::Options;
///
/// let options = Options::default()
///     .with_timeout(Duration::from_secs(30))
///     .with_max_payload_read(64 * 1024)
///     .with_utf8();
/// ```
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Deadline of every read and write.
    ///
    /// A server connection that receives nothing for this long sends a ping; a client connection
    /// gives up and closes.
    ///
    /// Default: 15 seconds as defined in [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,

    /// Maximum allowed payload size for incoming frames, in bytes.
    ///
    /// A frame announcing a larger payload closes the connection before the payload is read.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Whether received text frames are validated as UTF-8.
    ///
    /// When set, a text frame with invalid UTF-8 closes the connection instead of reaching the
    /// message callback.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Whether `TCP_NODELAY` is set on client sockets.
    ///
    /// Default: `true`
    pub no_delay: Option<bool>,
}

impl Options {
    /// Sets the deadline of every read and write.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the maximum allowed payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text frames.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Sets `TCP_NODELAY` on client sockets.
    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self {
            no_delay: Some(no_delay),
            ..self
        }
    }

    pub(crate) fn settings(&self) -> Settings {
        Settings {
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            max_payload_read: self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ),
            check_utf8: self.check_utf8,
            no_delay: self.no_delay.unwrap_or(true),
        }
    }
}

/// `Options` with every default filled in.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    pub timeout: Duration,
    pub max_payload_read: usize,
    pub check_utf8: bool,
    pub no_delay: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Options::default().settings();
        assert_eq!(settings.timeout, Duration::from_secs(15));
        assert_eq!(settings.max_payload_read, 1024 * 1024);
        assert!(!settings.check_utf8);
        assert!(settings.no_delay);
    }

    #[test]
    fn test_builder() {
        let settings = Options::default()
            .with_timeout(Duration::from_millis(250))
            .with_max_payload_read(10)
            .with_utf8()
            .with_no_delay(false)
            .settings();
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.max_payload_read, 10);
        assert!(settings.check_utf8);
        assert!(!settings.no_delay);
    }
}
