use std::fmt::{self, Debug};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver};

use crate::failure::{FailureKind, PropagatedFailure};

/// Receives every failure that is not delivered through a task handle.
///
/// One observer is shared by all workers of a pool, so it is called from
/// worker threads concurrently.
#[derive(Clone)]
pub struct FailureObserver(Arc<dyn Fn(PropagatedFailure) + Send + Sync + 'static>);

impl FailureObserver {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(PropagatedFailure) + Send + Sync + 'static,
    {
        FailureObserver(Arc::new(f))
    }

    /// Logs each failure at error level.
    pub fn logging() -> Self {
        FailureObserver::new(|failure| {
            // thread faults were logged by the fault guard already
            if failure.kind() != FailureKind::ThreadFault {
                log::error!("unobserved {}", failure);
            }
        })
    }

    /// Forwards failures into a channel.
    pub fn channel() -> (Self, Receiver<PropagatedFailure>) {
        let (sender, receiver) = unbounded();
        let observer = FailureObserver::new(move |failure| {
            if let Err(e) = sender.send(failure) {
                log::error!("failure receiver is gone, dropping {}", e.0);
            }
        });
        (observer, receiver)
    }

    pub(crate) fn observe(&self, failure: PropagatedFailure) {
        (self.0)(failure)
    }
}

impl Default for FailureObserver {
    fn default() -> Self {
        FailureObserver::logging()
    }
}

impl Debug for FailureObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureObserver")
    }
}
