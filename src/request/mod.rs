//! Building and starting requests.
//!
//! A [`Request`] is an immutable description of one GET request: the locator,
//! headers, timeout, and an optional required interface. Nothing is checked
//! while building; validation happens when the request is composed or started,
//! and a request which fails validation never creates a connection.
//!
//! ```
//! use std::time::Duration;
//! use httpreq::Request;
//!
//! let request = Request::builder("http://example:8080/status?verbose=1")
//!     .header("Accept", "text/plain")
//!     .timeout(Duration::from_secs(5))
//!     .build();
//!
//! let endpoint = request.endpoint().unwrap();
//! assert_eq!(endpoint.port, 8080);
//! assert!(!endpoint.is_secure());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Uri};
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::RequestConfig;
use crate::connection::{Completion, DataHandler, Execution, Launch};
use crate::pinning::{native_roots, PinningPolicy};
use crate::transport::{Connect, Endpoint, Interface, TcpConnector, TlsParameters};
use crate::{DebugLiteral, Error};

pub mod headers;

pub use self::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Timeout {
    Exact(Duration),
    Seconds(f64),
}

/// A single GET request.
#[derive(Debug, Clone)]
pub struct Request {
    locator: String,
    method: Method,
    headers: Headers,
    timeout: Option<Timeout>,
    interface: Option<Interface>,
    config: Arc<RequestConfig>,
}

impl Request {
    /// Start building a request for `locator`.
    pub fn builder(locator: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(locator.into())
    }

    /// The locator exactly as given.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Caller supplied headers, before defaults are applied.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The interface class the connection must use, if any.
    pub fn interface(&self) -> Option<Interface> {
        self.interface
    }

    /// The configuration this request was built with.
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// The exact bytes which will be sent.
    pub fn payload(&self) -> Result<Bytes, Error> {
        let target = self.target()?;
        self.compose(&target)
    }

    /// Where the request will connect, with TLS checked by the default policy
    /// against the native trust anchors.
    pub fn endpoint(&self) -> Result<Endpoint, Error> {
        let target = self.target()?;
        Ok(target.endpoint(self.interface, PinningPolicy::default(), None))
    }

    /// The validated timeout.
    pub fn timeout(&self) -> Result<Duration, Error> {
        match self.timeout {
            None => Ok(self.config.default_timeout),
            Some(Timeout::Exact(timeout)) => bounded(timeout),
            Some(Timeout::Seconds(seconds)) => {
                if seconds < 0.0 {
                    return Err(Error::NegativeTimeout);
                }
                if seconds.is_nan() || seconds >= i64::MAX as f64 {
                    return Err(Error::TimeoutOutOfBounds);
                }
                Duration::try_from_secs_f64(seconds)
                    .map_err(|_| Error::TimeoutOutOfBounds)
                    .and_then(bounded)
            }
        }
    }

    /// Prepare to run this request.
    pub fn call(&self) -> Call<'_> {
        Call::new(self)
    }

    fn target(&self) -> Result<Target, Error> {
        let bad = || Error::BadLocator(self.locator.clone());

        let uri: Uri = self.locator.parse().map_err(|_| bad())?;
        let secure = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => false,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => true,
            _ => return Err(bad()),
        };

        let authority = uri.host().filter(|host| !host.is_empty()).ok_or_else(bad)?;
        let host = authority
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(authority);
        if host.is_empty() {
            return Err(bad());
        }

        let port = uri
            .port()
            .and_then(|port| port.as_str().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .unwrap_or(if secure {
                self.config.https_port
            } else {
                self.config.http_port
            });

        let server_name = if secure {
            let name = ServerName::try_from(host.to_owned()).map_err(|_| bad())?;
            Some(name)
        } else {
            None
        };

        let path = match uri.path() {
            "" => "/",
            path => path,
        };
        let path_and_query = match uri.query() {
            Some(query) if !query.is_empty() => format!("{path}?{query}"),
            _ => path.to_owned(),
        };

        Ok(Target {
            authority: authority.to_owned(),
            host: host.to_owned(),
            port,
            server_name,
            path_and_query,
        })
    }

    fn compose(&self, target: &Target) -> Result<Bytes, Error> {
        if self.method != Method::GET {
            return Err(Error::InvalidMethod(self.method.clone()));
        }

        let headers = self.config.default_headers.merged(&self.headers);
        if let Some(invalid) = headers.find_invalid() {
            return Err(Error::InvalidHeader(invalid.to_owned()));
        }

        let mut payload = BytesMut::new();
        payload.put_slice(self.method.as_str().as_bytes());
        payload.put_u8(b' ');
        payload.put_slice(target.path_and_query.as_bytes());
        payload.put_slice(b" HTTP/1.1\r\n");
        line(&mut payload, "Host", &target.authority);
        for (key, value) in headers.iter() {
            line(&mut payload, key, value);
        }
        payload.put_slice(b"\r\n");

        Ok(payload.freeze())
    }
}

fn line(buf: &mut BytesMut, key: &str, value: &str) {
    buf.put_slice(key.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

fn bounded(timeout: Duration) -> Result<Duration, Error> {
    if timeout.as_secs() >= i64::MAX as u64 {
        Err(Error::TimeoutOutOfBounds)
    } else {
        Ok(timeout)
    }
}

/// A validated locator.
#[derive(Debug)]
struct Target {
    /// Host as written, with IPv6 brackets, for the `Host` header.
    authority: String,
    host: String,
    port: u16,
    server_name: Option<ServerName<'static>>,
    path_and_query: String,
}

impl Target {
    fn endpoint(
        self,
        interface: Option<Interface>,
        pinning: PinningPolicy,
        roots: Option<Arc<RootCertStore>>,
    ) -> Endpoint {
        let tls = self.server_name.map(|server_name| TlsParameters {
            server_name,
            pinning,
            roots: roots.unwrap_or_else(native_roots),
        });

        Endpoint {
            host: self.host,
            port: self.port,
            tls,
            interface,
        }
    }
}

/// Builder for [`Request`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    locator: String,
    method: Method,
    headers: Headers,
    timeout: Option<Timeout>,
    interface: Option<Interface>,
    config: Option<RequestConfig>,
}

impl RequestBuilder {
    fn new(locator: String) -> Self {
        Self {
            locator,
            method: Method::GET,
            headers: Headers::new(),
            timeout: None,
            interface: None,
            config: None,
        }
    }

    /// Set the method. Only GET can be started.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set one header, replacing an earlier value for the same key.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Merge a set of headers into the headers set so far.
    pub fn headers(mut self, headers: &Headers) -> Self {
        self.headers.merge(headers);
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Timeout::Exact(timeout));
        self
    }

    /// Set the timeout in seconds. Negative or unrepresentable values are
    /// rejected when the request is started.
    pub fn timeout_secs(mut self, seconds: f64) -> Self {
        self.timeout = Some(Timeout::Seconds(seconds));
        self
    }

    /// Require the connection to use a class of network interface.
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Use `config` instead of the default configuration.
    pub fn config(mut self, config: RequestConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Finish building.
    pub fn build(self) -> Request {
        Request {
            locator: self.locator,
            method: self.method,
            headers: self.headers,
            timeout: self.timeout,
            interface: self.interface,
            config: Arc::new(self.config.unwrap_or_default()),
        }
    }
}

/// Options for one execution of a [`Request`].
///
/// By default the request connects with a [`TcpConnector`] on the current
/// tokio runtime, and checks TLS peers with [`PinningPolicy::Normal`] against
/// the native trust anchors.
pub struct Call<'r, C = TcpConnector> {
    request: &'r Request,
    connector: C,
    pinning: PinningPolicy,
    roots: Option<Arc<RootCertStore>>,
    scheduler: Option<Handle>,
    on_data: Option<DataHandler>,
    on_complete: Option<Completion>,
}

impl<C: fmt::Debug> fmt::Debug for Call<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("request", &self.request)
            .field("connector", &self.connector)
            .field("pinning", &self.pinning)
            .field("scheduler", &self.scheduler)
            .field("on_data", &self.on_data.as_ref().map(|_| DebugLiteral("<handler>")))
            .field(
                "on_complete",
                &self.on_complete.as_ref().map(|_| DebugLiteral("<callback>")),
            )
            .finish()
    }
}

impl<'r> Call<'r> {
    fn new(request: &'r Request) -> Self {
        Call {
            request,
            connector: TcpConnector::default(),
            pinning: PinningPolicy::default(),
            roots: None,
            scheduler: None,
            on_data: None,
            on_complete: None,
        }
    }
}

impl<'r, C> Call<'r, C> {
    /// Create transports with `connector`.
    pub fn connector<C2: Connect>(self, connector: C2) -> Call<'r, C2> {
        Call {
            request: self.request,
            connector,
            pinning: self.pinning,
            roots: self.roots,
            scheduler: self.scheduler,
            on_data: self.on_data,
            on_complete: self.on_complete,
        }
    }

    /// Check TLS peers with `pinning`.
    pub fn pinning(mut self, pinning: PinningPolicy) -> Self {
        self.pinning = pinning;
        self
    }

    /// Trust anchors for [`PinningPolicy::Normal`].
    pub fn roots(mut self, roots: Arc<RootCertStore>) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Run the request on `scheduler` rather than the current runtime.
    pub fn scheduler(mut self, scheduler: Handle) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Receive data and errors as the request runs.
    pub fn on_data<F>(mut self, handler: F) -> Self
    where
        F: FnMut(Result<Bytes, Error>) + Send + 'static,
    {
        self.on_data = Some(Box::new(handler));
        self
    }

    /// Called once when the request has finished.
    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(completion));
        self
    }
}

impl<C: Connect> Call<'_, C> {
    /// Validate the request and start it.
    ///
    /// Validation errors are returned here, and no transport is created for
    /// them. Everything that goes wrong afterwards is delivered to the data
    /// handler.
    pub fn start(self) -> Result<Execution, Error> {
        let request = self.request;
        let target = request.target()?;
        let timeout = request.timeout()?;
        let payload = request.compose(&target)?;

        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Handle::try_current().map_err(|error| Error::Unknown(error.into()))?,
        };

        let deadline = {
            let _runtime = scheduler.enter();
            Instant::now()
                .checked_add(timeout)
                .ok_or(Error::TimeoutOutOfBounds)?
        };

        let endpoint = target.endpoint(request.interface, self.pinning, self.roots);
        let span = tracing::debug_span!(
            "request",
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.is_secure()
        );
        tracing::trace!(parent: &span, ?timeout, bytes = payload.len(), "starting request");

        let launch = Launch {
            transport: self.connector.connect(endpoint),
            payload,
            window: request.config.receive_window,
            deadline,
            handler: self.on_data,
            completion: self.on_complete,
        };

        Ok(launch.spawn(&scheduler, span))
    }
}
