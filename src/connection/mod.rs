//! The connection state machine.
//!
//! One [`Connection`] owns one transport for the lifetime of one request. The
//! transport pushes state changes and I/O completions into the connection as
//! events; the deadline timer and the caller push cancellation requests into
//! the same queue. A single task takes events off the queue one at a time, so
//! transition handling never runs concurrently for a connection.
//!
//! | Event | Action |
//! |---|---|
//! | `setup`, `preparing` | none |
//! | `ready` | ensure the receive loop is running; send the request the first time only |
//! | `waiting(err)` | report [`Error::Wait`], cancel |
//! | `failed(err)` | report [`Error::Connection`], cancel |
//! | `cancelled` | disarm the deadline, run the completion callback, stop |
//! | data received | report the bytes; cancel when complete, stop receiving on error, otherwise receive again |
//! | send failed | report [`Error::Send`], cancel |
//! | chain rejected | report [`Error::Pinning`], cancel |
//! | deadline or caller cancel | cancel |
//!
//! Cancelling is latched: the transport is cancelled at most once, and only the
//! transport reporting `cancelled` ends the connection.

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, trace, warn, Instrument};

use crate::config::ReceiveWindow;
use crate::transport::{ConnectionState, Event, EventSink, Received, Transport};
use crate::{BoxError, Error};

mod deadline;
mod execution;

use self::deadline::DeadlineTimer;
pub use self::execution::{Execution, Finished};

/// Receives data and runtime errors for a request.
pub type DataHandler = Box<dyn FnMut(Result<Bytes, Error>) + Send>;

/// Called once when a request has finished.
pub type Completion = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Finished,
}

/// Everything needed to run one request over one transport.
pub(crate) struct Launch<T> {
    pub(crate) transport: T,
    pub(crate) payload: Bytes,
    pub(crate) window: ReceiveWindow,
    pub(crate) deadline: Instant,
    pub(crate) handler: Option<DataHandler>,
    pub(crate) completion: Option<Completion>,
}

impl<T: Transport> Launch<T> {
    /// Arm the deadline, start the transport and receive loop, and hand the
    /// connection to a task on `scheduler`.
    pub(crate) fn spawn(self, scheduler: &Handle, span: tracing::Span) -> Execution {
        let (events, rx) = EventSink::channel();
        let timer = DeadlineTimer::arm(scheduler, self.deadline, events.clone());

        let mut connection = Connection {
            transport: self.transport,
            payload: self.payload,
            window: self.window,
            deadline: timer,
            handler: self.handler,
            completion: self.completion,
            sent: false,
            receiving: false,
            cancelling: false,
        };

        {
            let _guard = span.enter();
            connection.start(scheduler, events.clone());
        }

        let task = scheduler.spawn(connection.run(rx).instrument(span));
        Execution::new(events, task)
    }
}

/// State machine for a single connection.
pub(crate) struct Connection<T> {
    transport: T,
    payload: Bytes,
    window: ReceiveWindow,
    deadline: DeadlineTimer,
    handler: Option<DataHandler>,
    completion: Option<Completion>,
    sent: bool,
    receiving: bool,
    cancelling: bool,
}

impl<T: Transport> Connection<T> {
    fn start(&mut self, scheduler: &Handle, events: EventSink) {
        self.transport.start(scheduler, events);
        self.ensure_receiving();
    }

    async fn run(mut self, mut events: UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if self.on_event(event) == Flow::Finished {
                return;
            }
        }

        warn!("transport went away without reporting cancellation");
        self.finish();
    }

    pub(crate) fn on_event(&mut self, event: Event) -> Flow {
        match event {
            Event::State(state) => return self.on_state(state),
            Event::Received(received) => self.on_received(received),
            Event::Sent(result) => self.on_sent(result),
            Event::Rejected(error) => {
                self.deliver(Err(Error::Pinning(error)));
                self.cancel();
            }
            Event::Cancel(reason) => {
                debug!(?reason, "cancel requested");
                self.cancel();
            }
        }

        Flow::Continue
    }

    fn on_state(&mut self, state: ConnectionState) -> Flow {
        debug!(%state, "connection state changed");
        match state {
            ConnectionState::Setup | ConnectionState::Preparing => {}
            ConnectionState::Ready => {
                self.ensure_receiving();
                if self.sent {
                    trace!("ready again, request already sent");
                } else {
                    self.sent = true;
                    trace!(bytes = self.payload.len(), "sending request");
                    self.transport.send(self.payload.clone());
                }
            }
            ConnectionState::Waiting(error) => {
                self.deliver(Err(Error::Wait(error)));
                self.cancel();
            }
            ConnectionState::Failed(error) => {
                self.deliver(Err(Error::Connection(error)));
                self.cancel();
            }
            ConnectionState::Cancelled => {
                self.finish();
                return Flow::Finished;
            }
        }

        Flow::Continue
    }

    fn on_received(&mut self, received: Received) {
        if let Some(data) = received.data {
            trace!(bytes = data.len(), "received");
            self.deliver(Ok(data));
        }

        if received.complete {
            trace!("peer finished sending");
            self.cancel();
        } else if let Some(error) = received.error {
            self.deliver(Err(Error::Receive(error)));
        } else if !self.cancelling {
            self.transport
                .receive(self.window.minimum, self.window.maximum);
        }
    }

    fn on_sent(&mut self, result: Result<(), BoxError>) {
        match result {
            Ok(()) => trace!("request sent"),
            Err(error) => {
                self.deliver(Err(Error::Send(error)));
                self.cancel();
            }
        }
    }

    fn ensure_receiving(&mut self) {
        if !self.receiving {
            self.receiving = true;
            self.transport
                .receive(self.window.minimum, self.window.maximum);
        }
    }

    fn cancel(&mut self) {
        if self.cancelling {
            trace!("already cancelling");
            return;
        }
        self.cancelling = true;
        self.transport.cancel();
    }

    fn finish(&mut self) {
        let expired = !self.deadline.is_armed();
        self.deadline.disarm();
        if let Some(completion) = self.completion.take() {
            debug!(expired, "connection finished");
            completion();
        }
    }

    fn deliver(&mut self, result: Result<Bytes, Error>) {
        match (&mut self.handler, result) {
            (Some(handler), result) => handler(result),
            (None, Err(error)) => debug!(%error, "unhandled request error"),
            (None, Ok(data)) => trace!(bytes = data.len(), "unhandled data"),
        }
    }
}
