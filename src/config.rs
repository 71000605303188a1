//! Fixed configuration values used when composing and running a request.
//!
//! These replace process-wide constants: a [`RequestConfig`] is handed to the
//! [`RequestBuilder`](crate::RequestBuilder) and is never mutated afterwards.

use std::time::Duration;

use crate::request::Headers;

/// Port used for `http` locators without an explicit port.
pub const HTTP_PORT: u16 = 80;

/// Port used for `https` locators without an explicit port.
pub const HTTPS_PORT: u16 = 443;

/// The range of bytes requested from the transport on each receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    /// Smallest amount of data a receive should wait for before completing.
    pub minimum: usize,

    /// Largest amount of data a single receive may deliver.
    pub maximum: usize,
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self {
            minimum: 1,
            maximum: u16::MAX as usize,
        }
    }
}

/// Configuration shared by every request built with it.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Headers sent with every request unless the caller overrides them.
    pub default_headers: Headers,

    /// Default port for the insecure scheme.
    pub http_port: u16,

    /// Default port for the secure scheme.
    pub https_port: u16,

    /// Bytes requested per receive.
    pub receive_window: ReceiveWindow,

    /// Timeout used when the builder is not given one.
    pub default_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        let mut default_headers = Headers::new();
        default_headers.insert("User-Agent", "generic/1.0");
        default_headers.insert("Accept", "*/*");
        default_headers.insert("Connection", "close");

        Self {
            default_headers,
            http_port: HTTP_PORT,
            https_port: HTTPS_PORT,
            receive_window: ReceiveWindow::default(),
            default_timeout: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_headers_in_order() {
        let config = RequestConfig::default();
        let keys: Vec<_> = config.default_headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["User-Agent", "Accept", "Connection"]);
        assert_eq!(config.default_headers.get("Connection"), Some("close"));
    }

    #[test]
    fn receive_window() {
        let window = ReceiveWindow::default();
        assert_eq!(window.minimum, 1);
        assert_eq!(window.maximum, 65535);
    }
}
