//! httpreq
//!
//! A very small HTTP client for a single request over a raw TCP (optionally TLS)
//! connection.
//!
//! The client writes the request line and headers by hand, drives the connection
//! through an explicit state machine, and hands back whatever bytes arrive, raw.
//! Responses are not parsed. A deadline timer independent of the transport's own
//! timeouts guarantees that every execution terminates, and the peer's certificate
//! chain is checked against a [`PinningPolicy`] before the request is sent.
//!
//! ```no_run
//! # async fn run() -> Result<(), httpreq::Error> {
//! use httpreq::{PinningPolicy, Request};
//!
//! let request = Request::builder("https://example.com/").build();
//! let execution = request
//!     .call()
//!     .pinning(PinningPolicy::Normal)
//!     .on_data(|result| match result {
//!         Ok(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
//!         Err(error) => eprintln!("{error}"),
//!     })
//!     .start()?;
//!
//! execution.await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod config;
pub mod connection;
mod error;
pub mod pinning;
pub mod request;
pub mod transport;

pub use self::config::RequestConfig;
pub use self::connection::Execution;
pub use self::error::{BoxError, Error};
pub use self::pinning::{PinningError, PinningPolicy};
pub use self::request::{Call, Request, RequestBuilder};
pub use self::transport::{ConnectionState, Endpoint, Interface};

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
