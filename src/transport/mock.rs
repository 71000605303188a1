//! A transport which performs no I/O, suitable for testing the connection
//! state machine.
//!
//! Every [`MockTransport`] records what it was asked to do. Tests reach the
//! transport through a [`MockHandle`] and push events into the connection with
//! it, standing in for the network.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::trace;

use super::{Connect, ConnectionState, Endpoint, EventSink, Received, Transport};
use crate::BoxError;

#[derive(Debug, Default)]
struct Record {
    events: Option<EventSink>,
    starts: usize,
    sent: Vec<Bytes>,
    receives: Vec<(usize, usize)>,
    cancels: usize,
}

/// Constructs [`MockTransport`]s and remembers them.
#[derive(Debug, Clone)]
pub struct MockConnector {
    created: Arc<Mutex<Vec<(Endpoint, MockHandle)>>>,
    report_cancel: bool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Transports which report [`ConnectionState::Cancelled`] when cancelled.
    pub fn new() -> Self {
        Self {
            created: Default::default(),
            report_cancel: true,
        }
    }

    /// Transports which stay silent when cancelled; cancellation is only
    /// recorded.
    pub fn silent() -> Self {
        Self {
            report_cancel: false,
            ..Self::new()
        }
    }

    /// The endpoint the most recent transport was created for.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.created.lock().last().map(|(endpoint, _)| endpoint.clone())
    }

    /// Handle to the most recent transport.
    pub fn handle(&self) -> Option<MockHandle> {
        self.created.lock().last().map(|(_, handle)| handle.clone())
    }

    /// Number of transports created.
    pub fn connections(&self) -> usize {
        self.created.lock().len()
    }
}

impl Connect for MockConnector {
    type Transport = MockTransport;

    fn connect(&self, endpoint: Endpoint) -> Self::Transport {
        let handle = MockHandle {
            record: Default::default(),
        };
        trace!(host = %endpoint.host, port = endpoint.port, "creating mock transport");
        self.created.lock().push((endpoint, handle.clone()));

        MockTransport {
            handle,
            report_cancel: self.report_cancel,
        }
    }
}

/// A transport which only records calls.
#[derive(Debug)]
pub struct MockTransport {
    handle: MockHandle,
    report_cancel: bool,
}

impl Transport for MockTransport {
    fn start(&mut self, _scheduler: &Handle, events: EventSink) {
        let mut record = self.handle.record.lock();
        record.starts += 1;
        record.events = Some(events);
    }

    fn send(&mut self, payload: Bytes) {
        self.handle.record.lock().sent.push(payload);
    }

    fn receive(&mut self, minimum: usize, maximum: usize) {
        self.handle.record.lock().receives.push((minimum, maximum));
    }

    fn cancel(&mut self) {
        let events = {
            let mut record = self.handle.record.lock();
            record.cancels += 1;
            if record.cancels > 1 || !self.report_cancel {
                return;
            }
            record.events.clone()
        };

        if let Some(events) = events {
            events.state(ConnectionState::Cancelled);
        }
    }
}

/// Inspects and drives a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockHandle {
    record: Arc<Mutex<Record>>,
}

impl MockHandle {
    /// Times the transport was started.
    pub fn starts(&self) -> usize {
        self.record.lock().starts
    }

    /// Payloads passed to `send`.
    pub fn sent(&self) -> Vec<Bytes> {
        self.record.lock().sent.clone()
    }

    /// `(minimum, maximum)` of each receive requested.
    pub fn receives(&self) -> Vec<(usize, usize)> {
        self.record.lock().receives.clone()
    }

    /// Times the transport was cancelled.
    pub fn cancels(&self) -> usize {
        self.record.lock().cancels
    }

    /// Push a state change, as the network would.
    pub fn state(&self, state: ConnectionState) {
        if let Some(events) = self.events() {
            events.state(state);
        }
    }

    /// Complete the outstanding receive.
    pub fn received(&self, received: Received) {
        if let Some(events) = self.events() {
            events.received(received);
        }
    }

    /// Complete the outstanding send.
    pub fn sent_result(&self, result: Result<(), BoxError>) {
        if let Some(events) = self.events() {
            events.sent(result);
        }
    }

    /// The event sink the transport was started with.
    pub fn events(&self) -> Option<EventSink> {
        self.record.lock().events.clone()
    }
}
