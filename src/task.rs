//! Tracked work items and the handles callers use to observe them.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::failure::PropagatedFailure;
use crate::observer::FailureObserver;
use crate::thread_pool::hooks;

/// Cooperative cancellation flag handed to cancellable work items.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// What a tracked body produced when it did not return a value.
enum Captured {
    Error(anyhow::Error),
    Panic(Box<dyn Any + Send + 'static>),
}

enum State<T> {
    Pending,
    Running,
    Cancelled,
    // outcome recorded, failures still wait for the post-execution hook
    Finished(Result<T, Captured>),
    // failure raised by the hook, not yet routed
    Inspected,
    Raised(PropagatedFailure),
    Consumed,
}

struct Slot<T> {
    state: State<T>,
    attached: bool,
}

impl<T> Slot<T> {
    fn is_settled(&self) -> bool {
        matches!(
            self.state,
            State::Finished(Ok(_)) | State::Raised(_) | State::Consumed
        )
    }

    fn take_settled(&mut self) -> Option<Result<T, PropagatedFailure>> {
        match mem::replace(&mut self.state, State::Consumed) {
            State::Finished(Ok(value)) => Some(Ok(value)),
            State::Raised(failure) => Some(Err(failure)),
            other => {
                self.state = other;
                None
            }
        }
    }
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
    token: CancelToken,
    observer: FailureObserver,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, result: Result<T, Captured>) {
        let mut slot = self.lock();
        match slot.state {
            State::Running => {
                slot.state = State::Finished(result);
                drop(slot);
                self.settled.notify_all();
            }
            // cancelled while running, the produced outcome is discarded
            _ => {
                drop(slot);
                drop(result);
            }
        }
    }

    fn cancel(&self) -> bool {
        let mut slot = self.lock();
        match slot.state {
            State::Pending | State::Running => {
                slot.state = State::Cancelled;
                self.token.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Type-erased view of a tracked item's state, used by the worker hooks.
pub(crate) trait TaskRecord: Send + Sync {
    /// Marks the item as running. False when it was cancelled before it started.
    fn begin(&self) -> bool;

    /// Converts a recorded failure or cancellation into a [`PropagatedFailure`].
    /// Returns `None` for a success or an outcome that is not yet determined.
    fn inspect(&self) -> Option<PropagatedFailure>;

    /// Hands the failure to the task handle, or to the observer when nobody
    /// holds the handle any more.
    fn deliver(&self, failure: PropagatedFailure);

    fn cancel(&self) -> bool;
}

impl<T: Send> TaskRecord for Shared<T> {
    fn begin(&self) -> bool {
        let mut slot = self.lock();
        match slot.state {
            State::Pending => {
                slot.state = State::Running;
                true
            }
            _ => false,
        }
    }

    fn inspect(&self) -> Option<PropagatedFailure> {
        let mut slot = self.lock();
        match mem::replace(&mut slot.state, State::Inspected) {
            State::Finished(Err(Captured::Error(e))) => Some(PropagatedFailure::task_failed(e)),
            State::Finished(Err(Captured::Panic(p))) => Some(PropagatedFailure::task_panicked(p)),
            State::Cancelled => Some(PropagatedFailure::cancelled()),
            other => {
                slot.state = other;
                None
            }
        }
    }

    fn deliver(&self, failure: PropagatedFailure) {
        let mut slot = self.lock();
        if slot.attached && !slot.is_settled() {
            slot.state = State::Raised(failure);
            drop(slot);
            self.settled.notify_all();
            return;
        }

        if let State::Inspected = slot.state {
            slot.state = State::Consumed;
        }
        drop(slot);
        self.observer.observe(failure);
    }

    fn cancel(&self) -> bool {
        Shared::cancel(self)
    }
}

/// A queued tracked item: its body plus the record the hooks inspect.
///
/// Dropping a task that never ran cancels it, so its handle is not left waiting.
pub(crate) struct TrackedTask {
    record: Arc<dyn TaskRecord>,
    body: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TrackedTask {
    pub(crate) fn record(&self) -> Arc<dyn TaskRecord> {
        self.record.clone()
    }

    /// Runs the body (unless cancelled first) and then the post-execution hook.
    pub(crate) fn run(mut self) -> Result<(), PropagatedFailure> {
        let Some(body) = self.body.take() else {
            return Ok(());
        };

        if self.record.begin() {
            body();
        } else {
            drop(body);
        }

        hooks::after_execute(self.record.as_ref())
    }

    fn abandon(&mut self) {
        if self.body.take().is_none() {
            return;
        }

        self.record.cancel();
        if let Err(failure) = hooks::after_execute(self.record.as_ref()) {
            self.record.deliver(failure);
        }
    }
}

impl Drop for TrackedTask {
    fn drop(&mut self) {
        self.abandon();
    }
}

pub(crate) fn tracked<T, F>(job: F, observer: FailureObserver) -> (TrackedTask, TaskHandle<T>)
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static,
{
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            state: State::Pending,
            attached: true,
        }),
        settled: Condvar::new(),
        token: CancelToken::default(),
        observer,
    });

    let body_shared = shared.clone();
    let body = move || {
        let token = body_shared.token.clone();
        let result = match panic::catch_unwind(AssertUnwindSafe(|| job(&token))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Captured::Error(e)),
            Err(payload) => Err(Captured::Panic(payload)),
        };
        body_shared.complete(result);
    };

    let task = TrackedTask {
        record: shared.clone(),
        body: Some(Box::new(body)),
    };

    (task, TaskHandle { shared })
}

/// Handle to a submitted item.
///
/// A failure of the item is delivered here when the handle is alive. If the
/// handle is dropped before the failure is taken, the failure goes to the
/// pool's [`FailureObserver`] instead.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the item settles.
    pub fn join(self) -> Result<T, PropagatedFailure> {
        let mut slot = self.shared.lock();
        loop {
            if let Some(result) = slot.take_settled() {
                return result;
            }
            slot = self
                .shared
                .settled
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`join`](Self::join) but gives the handle back on timeout.
    pub fn join_timeout(self, timeout: Duration) -> Result<Result<T, PropagatedFailure>, Self> {
        let deadline = Instant::now() + timeout;
        let settled = {
            let mut slot = self.shared.lock();
            loop {
                if let Some(result) = slot.take_settled() {
                    break Some(result);
                }
                let now = Instant::now();
                if now >= deadline {
                    break None;
                }
                slot = match self.shared.settled.wait_timeout(slot, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        };

        match settled {
            Some(result) => Ok(result),
            None => Err(self),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().is_settled()
    }

    /// Cancels the item if it has not finished yet. Returns true if this call
    /// cancelled it.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        let mut slot = self.shared.lock();
        slot.attached = false;
        if let State::Raised(_) = slot.state {
            if let State::Raised(failure) = mem::replace(&mut slot.state, State::Consumed) {
                drop(slot);
                self.shared.observer.observe(failure);
            }
        }
    }
}
