use thiserror::Error;

use crate::pinning::PinningError;

/// A boxed error, used for errors reported by transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Request error type.
///
/// Validation errors (`BadLocator`, `NegativeTimeout`, `TimeoutOutOfBounds`,
/// `InvalidMethod`, `InvalidHeader`) are returned synchronously when a call is
/// started, before any connection exists. All other variants are delivered to
/// the data handler while the request runs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The locator has no recognized scheme, no host, or is not a valid URI.
    #[error("bad locator: {0:?}")]
    BadLocator(String),

    /// The timeout was negative.
    #[error("negative timeout")]
    NegativeTimeout,

    /// The timeout is too large to compute a deadline.
    #[error("timeout out of bounds")]
    TimeoutOutOfBounds,

    /// Only GET requests can be executed.
    #[error("invalid method: {0}")]
    InvalidMethod(http::Method),

    /// A header name or value would break the request framing.
    #[error("invalid header: {0:?}")]
    InvalidHeader(String),

    /// The connection failed.
    #[error("connection: {0}")]
    Connection(#[source] BoxError),

    /// The connection is waiting for a usable network path.
    #[error("waiting: {0}")]
    Wait(#[source] BoxError),

    /// Sending the request failed.
    #[error("send: {0}")]
    Send(#[source] BoxError),

    /// Receiving data failed.
    #[error("receive: {0}")]
    Receive(#[source] BoxError),

    /// The peer's certificate chain was not accepted.
    #[error("pinning: {0}")]
    Pinning(#[from] PinningError),

    /// Any other failure.
    #[error("unknown: {0}")]
    Unknown(#[source] BoxError),
}

impl Error {
    /// Whether this error was raised while validating the request, before
    /// any connection was attempted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::BadLocator(_)
                | Error::NegativeTimeout
                | Error::TimeoutOutOfBounds
                | Error::InvalidMethod(_)
                | Error::InvalidHeader(_)
        )
    }
}
