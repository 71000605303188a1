//! Transports for connecting to remote servers.
//!
//! A transport is responsible for establishing a connection to a remote endpoint,
//! shuffling bytes back and forth, and handling the low-level details of the
//! connection. The connection state machine only relies on the [`Transport`]
//! capability: it starts the transport, asks it to send and receive, and cancels
//! it. Everything the transport has to report (state changes, received data, send
//! completions, pinning rejections) flows back through an [`EventSink`].
//!
//! Two transports are provided:
//! - [`TcpTransport`]: connects over TCP/IP, optionally wrapped in TLS.
//! - `MockTransport` (with the `mocks` feature): records what it was asked to do
//!   and lets tests push events by hand.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::trace;

use crate::pinning::{PinningError, PinningPolicy};
use crate::BoxError;

#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod tcp;

pub use self::tcp::{TcpConnector, TcpTransport, TcpTransportConfig};

/// The lifecycle state of a connection, as reported by its transport.
#[derive(Debug)]
pub enum ConnectionState {
    /// Created, not yet started.
    Setup,

    /// Resolving, connecting, or handshaking.
    Preparing,

    /// Established and able to carry data.
    Ready,

    /// No usable path to the endpoint right now.
    Waiting(BoxError),

    /// The connection failed.
    Failed(BoxError),

    /// The connection was cancelled. Nothing follows this state.
    Cancelled,
}

impl ConnectionState {
    /// Short name of the state, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Setup => "setup",
            ConnectionState::Preparing => "preparing",
            ConnectionState::Ready => "ready",
            ConnectionState::Waiting(_) => "waiting",
            ConnectionState::Failed(_) => "failed",
            ConnectionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Waiting(error) | ConnectionState::Failed(error) => {
                write!(f, "{}({})", self.name(), error)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// The class of network interface a connection is required to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Wireless LAN.
    Wifi,

    /// Cellular data.
    Cellular,

    /// The local loopback interface.
    Loopback,

    /// Wired ethernet.
    WiredEthernet,

    /// Any other interface.
    Other,
}

impl Interface {
    /// Whether a connection to `addr` can satisfy this interface requirement.
    pub fn permits(&self, addr: &std::net::IpAddr) -> bool {
        match self {
            Interface::Loopback => addr.is_loopback(),
            _ => !addr.is_loopback(),
        }
    }
}

impl FromStr for Interface {
    type Err = Infallible;

    /// Parse an interface class name. Unknown names map to [`Interface::Other`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "WIFI" => Interface::Wifi,
            "CELL" | "CELLULAR" => Interface::Cellular,
            "LOOPBACK" | "LOOP" => Interface::Loopback,
            "WIRED" | "WIREDETHERNET" | "ETHERNET" => Interface::WiredEthernet,
            _ => Interface::Other,
        })
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interface::Wifi => "wifi",
            Interface::Cellular => "cellular",
            Interface::Loopback => "loopback",
            Interface::WiredEthernet => "wired ethernet",
            Interface::Other => "other",
        })
    }
}

/// TLS settings for a secure endpoint.
#[derive(Debug, Clone)]
pub struct TlsParameters {
    /// Name the peer certificate is checked against.
    pub server_name: ServerName<'static>,

    /// Policy deciding whether the peer's chain is trusted.
    pub pinning: PinningPolicy,

    /// Trust anchors for [`PinningPolicy::Normal`].
    pub roots: Arc<RootCertStore>,
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Host name or IP address, without IPv6 brackets.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// TLS settings, present for secure endpoints only.
    pub tls: Option<TlsParameters>,

    /// Required interface class, if any.
    pub interface: Option<Interface>,
}

impl Endpoint {
    /// Whether the connection is wrapped in TLS.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// The outcome of a single receive.
#[derive(Debug, Default)]
pub struct Received {
    /// Bytes read, if any.
    pub data: Option<Bytes>,

    /// The peer has finished sending.
    pub complete: bool,

    /// An error interrupted the receive.
    pub error: Option<BoxError>,
}

impl Received {
    /// A receive that produced `data`, with the stream still open.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
            ..Default::default()
        }
    }

    /// Mark the stream as finished.
    pub fn completed(mut self) -> Self {
        self.complete = true;
        self
    }

    /// A receive that failed with `error`.
    pub fn error(error: impl Into<BoxError>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Deadline,
    Caller,
}

#[derive(Debug)]
pub(crate) enum Event {
    State(ConnectionState),
    Received(Received),
    Sent(Result<(), BoxError>),
    Rejected(PinningError),
    Cancel(CancelReason),
}

/// Delivers transport events to the connection that owns the transport.
///
/// Events are queued and handled one at a time, in the order they were sent.
/// Events sent after the connection has finished are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub(crate) fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx }, rx)
    }

    /// Report a state change.
    pub fn state(&self, state: ConnectionState) {
        self.deliver(Event::State(state))
    }

    /// Report the result of a receive.
    pub fn received(&self, received: Received) {
        self.deliver(Event::Received(received))
    }

    /// Report the result of a send.
    pub fn sent(&self, result: Result<(), BoxError>) {
        self.deliver(Event::Sent(result))
    }

    /// Report that the peer's certificate chain was not accepted.
    pub fn rejected(&self, error: PinningError) {
        self.deliver(Event::Rejected(error))
    }

    pub(crate) fn cancel(&self, reason: CancelReason) {
        self.deliver(Event::Cancel(reason))
    }

    /// Whether the connection has stopped listening for events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn deliver(&self, event: Event) {
        if let Err(error) = self.tx.send(event) {
            trace!(event = ?error.0, "connection finished, dropping event");
        }
    }
}

/// A stream-oriented, optionally secure, connection.
///
/// Operations do not block and do not return results directly; outcomes are
/// reported through the [`EventSink`] passed to [`Transport::start`].
pub trait Transport: Send + 'static {
    /// Begin connecting, running any background work on `scheduler`.
    fn start(&mut self, scheduler: &Handle, events: EventSink);

    /// Write `payload` once the connection is ready. Reported with
    /// [`EventSink::sent`].
    fn send(&mut self, payload: Bytes);

    /// Read between `minimum` and `maximum` bytes once the connection is ready.
    /// Reported with [`EventSink::received`].
    fn receive(&mut self, minimum: usize, maximum: usize);

    /// Tear down the connection and report [`ConnectionState::Cancelled`].
    /// Calling this more than once has no further effect.
    fn cancel(&mut self);
}

/// Constructs transports for endpoints.
pub trait Connect {
    /// The transport produced.
    type Transport: Transport;

    /// Create a transport for `endpoint`. The transport does nothing until
    /// it is started.
    fn connect(&self, endpoint: Endpoint) -> Self::Transport;
}
