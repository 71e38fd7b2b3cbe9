// hooks run on the worker thread around every item
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crate::failure::{PanicPayload, PropagatedFailure};
use crate::task::TaskRecord;

/// Pre-execution hook: runs one item (and its post-execution hook) under a
/// thread-level fault guard.
///
/// A panic escaping `f` is logged once and turned into a thread fault. A
/// panic whose payload is already a [`PropagatedFailure`] is passed on as-is.
pub(crate) fn fault_guard<F>(f: F) -> Result<(), PropagatedFailure>
where
    F: FnOnce() -> Result<(), PropagatedFailure>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(escaped_fault(payload)),
    }
}

fn escaped_fault(payload: Box<dyn Any + Send + 'static>) -> PropagatedFailure {
    match payload.downcast::<PropagatedFailure>() {
        Ok(failure) => *failure,
        Err(payload) => {
            let payload = PanicPayload::new(payload);
            log::error!(
                "uncaught fault in thread {}: {}",
                thread::current().name().unwrap_or("<unnamed>"),
                payload.message()
            );
            PropagatedFailure::thread_fault(payload)
        }
    }
}

/// Post-execution hook: raises a failure when the item's outcome is a
/// captured error or a cancellation. Success and undetermined outcomes pass.
pub(crate) fn after_execute(record: &dyn TaskRecord) -> Result<(), PropagatedFailure> {
    match record.inspect() {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}
