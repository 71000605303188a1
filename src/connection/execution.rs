//! Caller-side handle to a running request.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project::pin_project;
use tokio::task::JoinHandle;

use crate::transport::{CancelReason, EventSink};
use crate::Error;

/// A request in flight.
///
/// Awaiting the execution waits until the connection has been cancelled and
/// the completion callback has run. Dropping it does not stop the request.
#[derive(Debug)]
pub struct Execution {
    control: EventSink,
    task: JoinHandle<()>,
}

impl Execution {
    pub(crate) fn new(control: EventSink, task: JoinHandle<()>) -> Self {
        Self { control, task }
    }

    /// Cancel the request. Cancelling more than once, or after the request
    /// has finished, does nothing.
    pub fn cancel(&self) {
        self.control.cancel(CancelReason::Caller);
    }

    /// Whether the request has finished and its completion callback has run.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl IntoFuture for Execution {
    type Output = Result<(), Error>;
    type IntoFuture = Finished;

    fn into_future(self) -> Self::IntoFuture {
        Finished { task: self.task }
    }
}

/// Future which resolves when an [`Execution`] finishes.
///
/// Resolves to [`Error::Unknown`] if a callback panicked or the runtime shut
/// down before the request finished.
#[derive(Debug)]
#[pin_project]
pub struct Finished {
    #[pin]
    task: JoinHandle<()>,
}

impl Future for Finished {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(self.project().task.poll(cx));
        Poll::Ready(outcome.map_err(|error| Error::Unknown(error.into())))
    }
}
