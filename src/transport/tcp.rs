//! TCP transport implementation, optionally wrapped in TLS.
//!
//! This module contains the [`TcpTransport`] type, a [`Transport`] which connects
//! to a remote endpoint over TCP, and the [`TcpTransportConfig`] type, which is
//! used to configure TCP sockets. Transports are created by a [`TcpConnector`],
//! which is the connector requests use unless told otherwise.
//!
//! All I/O happens on a background task spawned when the transport starts.
//! Sends and receives requested before the connection is ready are queued until
//! it is. Sends and receives are queued separately, so a receive waiting for
//! data never delays a send.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn, Instrument};

use super::{Connect, ConnectionState, Endpoint, EventSink, Received, TlsParameters, Transport};
use crate::pinning::{verifier, PinningError, TrustChain};
use crate::BoxError;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// The timeout for connecting to a single remote address.
    pub connect_timeout: Option<Duration>,

    /// Idle time before TCP keep-alive probes are sent.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Creates [`TcpTransport`]s sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: Arc<TcpTransportConfig>,
}

impl TcpConnector {
    /// A connector using `config` for every socket.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl Connect for TcpConnector {
    type Transport = TcpTransport;

    fn connect(&self, endpoint: Endpoint) -> Self::Transport {
        TcpTransport::new(endpoint, self.config.clone())
    }
}

#[derive(Debug)]
enum Command {
    Send(Bytes),
    Receive { minimum: usize, maximum: usize },
}

/// A connection to one endpoint over TCP, with TLS when the endpoint asks
/// for it.
///
/// State changes follow the connection's progress:
/// - `Waiting` when no address for the endpoint could be reached, including
///   when the required interface rules out every address.
/// - `Failed` when the TLS handshake fails, or when a read fails on an
///   established connection (after the failed receive is reported).
/// - `Ready` once connected, handshaken, and the certificate chain accepted.
///
/// A chain rejected by the pinning policy is reported as a rejection, not as a
/// state change.
#[derive(Debug)]
pub struct TcpTransport {
    endpoint: Option<Endpoint>,
    config: Arc<TcpTransportConfig>,
    commands: mpsc::UnboundedSender<Command>,
    queued: Option<mpsc::UnboundedReceiver<Command>>,
    events: Option<EventSink>,
    task: Option<AbortHandle>,
    cancelled: bool,
}

impl TcpTransport {
    /// A transport for `endpoint`. Nothing happens until it is started.
    pub fn new(endpoint: Endpoint, config: Arc<TcpTransportConfig>) -> Self {
        let (commands, queued) = mpsc::unbounded_channel();
        Self {
            endpoint: Some(endpoint),
            config,
            commands,
            queued: Some(queued),
            events: None,
            task: None,
            cancelled: false,
        }
    }

    fn command(&self, command: Command) {
        if let Err(error) = self.commands.send(command) {
            trace!(command = ?error.0, "transport closed, dropping command");
        }
    }
}

impl Transport for TcpTransport {
    fn start(&mut self, scheduler: &Handle, events: EventSink) {
        let (Some(endpoint), Some(commands)) = (self.endpoint.take(), self.queued.take()) else {
            warn!("tcp transport started twice");
            return;
        };

        events.state(ConnectionState::Setup);

        let span = tracing::debug_span!("tcp", host = %endpoint.host, port = endpoint.port);
        let driver = Driver {
            endpoint,
            config: self.config.clone(),
            events: events.clone(),
        };

        let task = scheduler.spawn(driver.run(commands).instrument(span));
        self.task = Some(task.abort_handle());
        self.events = Some(events);
    }

    fn send(&mut self, payload: Bytes) {
        self.command(Command::Send(payload));
    }

    fn receive(&mut self, minimum: usize, maximum: usize) {
        self.command(Command::Receive { minimum, maximum });
    }

    fn cancel(&mut self) {
        if std::mem::replace(&mut self.cancelled, true) {
            return;
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }

        trace!("tcp transport cancelled");
        if let Some(events) = &self.events {
            events.state(ConnectionState::Cancelled);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Handshake {
    Failed(BoxError),
    Rejected(PinningError),
}

/// Background half of a [`TcpTransport`]: owns the socket.
struct Driver {
    endpoint: Endpoint,
    config: Arc<TcpTransportConfig>,
    events: EventSink,
}

impl Driver {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.events.state(ConnectionState::Preparing);

        let tcp = match connect(&self.endpoint, &self.config).await {
            Ok(tcp) => tcp,
            Err(error) => {
                debug!(%error, "no path to endpoint");
                self.events.state(ConnectionState::Waiting(error.into()));
                return;
            }
        };

        let stream = match &self.endpoint.tls {
            None => Stream::Plain(tcp),
            Some(tls) => match handshake(tcp, tls).await {
                Ok(stream) => stream,
                Err(Handshake::Failed(error)) => {
                    debug!(%error, "tls handshake failed");
                    self.events.state(ConnectionState::Failed(error));
                    return;
                }
                Err(Handshake::Rejected(error)) => {
                    debug!(%error, "certificate chain not accepted");
                    self.events.rejected(error);
                    return;
                }
            },
        };

        self.events.state(ConnectionState::Ready);

        // Reads and writes each get their own queue so a pending receive never
        // holds up a send.
        let (reader, writer) = tokio::io::split(stream);
        let (payloads, queued_payloads) = mpsc::unbounded_channel();
        let (reads, queued_reads) = mpsc::unbounded_channel();

        let dispatch = async move {
            while let Some(command) = commands.recv().await {
                match command {
                    Command::Send(payload) => {
                        let _ = payloads.send(payload);
                    }
                    Command::Receive { minimum, maximum } => {
                        let _ = reads.send((minimum, maximum));
                    }
                }
            }
        };

        tokio::select! {
            () = dispatch => trace!("transport dropped, closing connection"),
            () = read_loop(reader, queued_reads, self.events.clone()) => {}
            () = write_loop(writer, queued_payloads, self.events.clone()) => {}
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut payloads: mpsc::UnboundedReceiver<Bytes>,
    events: EventSink,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = payloads.recv().await {
        let result = send(&mut writer, &payload).await;
        if let Err(error) = &result {
            debug!(%error, "send failed");
        } else {
            trace!(bytes = payload.len(), "sent");
        }
        events.sent(result.map_err(Into::into));
    }
}

/// Serve receive requests until the connection breaks. A read error ends the
/// connection, which is reported as `Failed` after the receive itself.
async fn read_loop<R>(
    mut reader: R,
    mut requests: mpsc::UnboundedReceiver<(usize, usize)>,
    events: EventSink,
) where
    R: AsyncRead + Unpin,
{
    while let Some((minimum, maximum)) = requests.recv().await {
        let received = receive(&mut reader, minimum, maximum).await;
        let failure = received
            .error
            .as_ref()
            .map(|error| TcpConnectionError::new(format!("connection lost: {error}")));

        events.received(received);
        if let Some(error) = failure {
            debug!(%error, "receive failed");
            events.state(ConnectionState::Failed(error.into()));
            return;
        }
    }
}

async fn handshake(tcp: TcpStream, tls: &TlsParameters) -> Result<Stream, Handshake> {
    let config = verifier::client_config().map_err(|error| Handshake::Failed(error.into()))?;
    let connector = TlsConnector::from(Arc::new(config));

    let stream = connector
        .connect(tls.server_name.clone(), tcp)
        .await
        .map_err(|error| Handshake::Failed(error.into()))?;
    trace!("tls handshake complete");

    let certificates = stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|chain| chain.to_vec())
        .unwrap_or_default();

    let chain = TrustChain::new(tls.server_name.clone(), certificates, tls.roots.clone());
    tls.pinning
        .decide(&chain)
        .await
        .map_err(Handshake::Rejected)?;

    Ok(Stream::Tls(Box::new(stream)))
}

async fn send<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> io::Result<()> {
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn receive<R>(stream: &mut R, minimum: usize, maximum: usize) -> Received
where
    R: AsyncRead + Unpin,
{
    let maximum = maximum.max(1);
    let minimum = minimum.clamp(1, maximum);

    let mut buf = vec![0; maximum];
    let mut filled = 0;
    let mut received = Received::default();

    while filled < minimum {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => {
                received.complete = true;
                break;
            }
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                trace!("peer closed without close_notify");
                received.complete = true;
                break;
            }
            Err(error) => {
                received.error = Some(error.into());
                break;
            }
        }
    }

    if filled > 0 {
        buf.truncate(filled);
        received.data = Some(Bytes::from(buf));
    }

    received
}

/// Resolve the endpoint and connect to the first address that answers.
async fn connect(
    endpoint: &Endpoint,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(TcpConnectionError::msg("dns resolution"))?;

    let candidates: Vec<SocketAddr> = addrs
        .filter(|addr| {
            endpoint
                .interface
                .map_or(true, |interface| interface.permits(&addr.ip()))
        })
        .collect();

    if candidates.is_empty() {
        return Err(match endpoint.interface {
            Some(interface) => {
                TcpConnectionError::new(format!("no address reachable over {interface} interface"))
            }
            None => TcpConnectionError::new("no addresses resolved"),
        });
    }

    let mut last_error = None;
    for address in candidates {
        match connect_addr(address, config).await {
            Ok(stream) => {
                trace!(peer.addr = %address, "tcp connected");
                return Ok(stream);
            }
            Err(error) => {
                trace!(%address, %error, "connection attempt failed");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| TcpConnectionError::new("exhausted connection candidates")))
}

#[tracing::instrument(skip(config), level = "debug")]
async fn connect_addr(
    address: SocketAddr,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let socket = match address {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(TcpConnectionError::msg("tcp open error"))?;
    trace!("tcp socket opened");

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    let connect = socket.connect(address);
    let stream = match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result,
            Err(e) => {
                trace!(timeout = ?dur, "connection timed out");
                Err(io::Error::new(io::ErrorKind::TimedOut, e))
            }
        },
        None => connect.await,
    }
    .map_err(TcpConnectionError::msg("tcp connect error"))?;

    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    if let Some(dur) = config.keep_alive_timeout {
        let keepalive = socket2::TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    Ok(stream)
}

/// Error type for TCP connections.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl TcpConnectionError {
    fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Plain or TLS wrapped TCP.
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod test {

    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::transport::{Event, Interface};

    fn endpoint(port: u16, interface: Option<Interface>) -> Endpoint {
        Endpoint {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port,
            tls: None,
            interface,
        }
    }

    async fn next_state(rx: &mut UnboundedReceiver<Event>) -> ConnectionState {
        match rx.recv().await.expect("transport stopped reporting") {
            Event::State(state) => state,
            other => panic!("expected a state change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interface_excludes_loopback() {
        let _ = tracing_subscriber::fmt::try_init();

        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();

        let config = TcpTransportConfig::default();
        let error = connect(&endpoint(port, Some(Interface::Wifi)), &config)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("wifi"));

        connect(&endpoint(port, Some(Interface::Loopback)), &config)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_waiting_without_path() {
        let mut transport = TcpConnector::default().connect(endpoint(1, Some(Interface::Cellular)));
        let (events, mut rx) = EventSink::channel();
        transport.start(&Handle::current(), events);

        assert!(matches!(next_state(&mut rx).await, ConnectionState::Setup));
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Preparing));
        assert!(matches!(
            next_state(&mut rx).await,
            ConnectionState::Waiting(_)
        ));

        transport.cancel();
        transport.cancel();
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Cancelled));
        drop(transport);
        assert!(rx.recv().await.is_none());
    }

    /// Events after `Ready`, until both a send completion and a receive
    /// have been seen. Their relative order is not fixed.
    async fn sent_and_received(
        rx: &mut UnboundedReceiver<Event>,
    ) -> (Result<(), BoxError>, Received) {
        let mut sent = None;
        let mut received = None;
        while sent.is_none() || received.is_none() {
            match rx.recv().await.expect("transport stopped reporting") {
                Event::Sent(result) => sent = Some(result),
                Event::Received(event) => received = Some(event),
                other => panic!("expected send or receive completion, got {other:?}"),
            }
        }
        (sent.unwrap(), received.unwrap())
    }

    async fn ready_transport(port: u16) -> (TcpTransport, UnboundedReceiver<Event>) {
        let mut transport = TcpConnector::default().connect(endpoint(port, None));
        let (events, mut rx) = EventSink::channel();

        // Queued before the connection exists, as a connection does.
        transport.receive(1, 1024);
        transport.start(&Handle::current(), events);

        assert!(matches!(next_state(&mut rx).await, ConnectionState::Setup));
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Preparing));
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Ready));
        (transport, rx)
    }

    #[tokio::test]
    async fn test_tcp_transport() {
        let _ = tracing_subscriber::fmt::try_init();

        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut server, _) = bind.accept().await.unwrap();
            let mut request = [0u8; 4];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"ping");
            server.write_all(b"pong").await.unwrap();
            server.shutdown().await.unwrap();
        });

        let (mut transport, mut rx) = ready_transport(port).await;

        // The receive queued first is still waiting when the send arrives.
        transport.send(Bytes::from_static(b"ping"));

        let (sent, received) = sent_and_received(&mut rx).await;
        sent.unwrap();
        assert_eq!(received.data.as_deref(), Some(&b"pong"[..]));
        assert!(received.error.is_none());
        server.await.unwrap();

        transport.receive(1, 1024);
        match rx.recv().await.unwrap() {
            Event::Received(received) => {
                assert!(received.complete);
                assert!(received.data.is_none());
            }
            other => panic!("expected end of stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_unsolicited_response() {
        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut server, _) = bind.accept().await.unwrap();
            server.write_all(b"pong").await.unwrap();
            let mut request = [0u8; 4];
            server.read_exact(&mut request).await.unwrap();
            request
        });

        let (mut transport, mut rx) = ready_transport(port).await;
        transport.send(Bytes::from_static(b"ping"));

        let (sent, received) = sent_and_received(&mut rx).await;
        sent.unwrap();
        assert_eq!(received.data.as_deref(), Some(&b"pong"[..]));
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_tcp_reset_fails_connection() {
        let bind = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = bind.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut server, _) = bind.accept().await.unwrap();
            let mut request = [0u8; 4];
            server.read_exact(&mut request).await.unwrap();
            socket2::SockRef::from(&server)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(server);
        });

        let (mut transport, mut rx) = ready_transport(port).await;
        transport.send(Bytes::from_static(b"ping"));

        let (sent, received) = sent_and_received(&mut rx).await;
        sent.unwrap();
        assert!(received.error.is_some(), "expected a read error, got {received:?}");
        assert!(!received.complete);

        match next_state(&mut rx).await {
            ConnectionState::Failed(error) => {
                assert!(error.to_string().contains("connection lost"), "{error}")
            }
            other => panic!("expected failure, got {other}"),
        }

        transport.cancel();
        assert!(matches!(next_state(&mut rx).await, ConnectionState::Cancelled));
    }
}
