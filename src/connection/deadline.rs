//! Deadline timer which forces a connection to end.

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::transport::{CancelReason, EventSink};

/// One scheduled cancellation for one connection attempt.
///
/// The timer never touches the transport itself: on expiry it asks the
/// connection to cancel through the same event path every other cancellation
/// uses. It is armed once, and disarmed either by the connection reaching its
/// terminal state or by being dropped.
#[derive(Debug)]
pub(crate) struct DeadlineTimer {
    task: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    /// Schedule a cancellation request on `trigger` at `deadline`.
    pub(crate) fn arm(scheduler: &Handle, deadline: Instant, trigger: EventSink) -> Self {
        let task = scheduler.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!("deadline passed, cancelling connection");
            trigger.cancel(CancelReason::Deadline);
        });

        Self { task: Some(task) }
    }

    /// Whether the timer can still fire.
    pub(crate) fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the timer. Has no effect once disarmed.
    pub(crate) fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            trace!("deadline timer disarmed");
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
