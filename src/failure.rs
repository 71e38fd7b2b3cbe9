// failures raised by the pool
use std::any::Any;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};
use std::panic;
use std::sync::Mutex;
use std::thread;

/// Which path detected the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The work item returned (or panicked with) an error inside the tracked wrapper.
    TaskFailure,
    /// The work item's handle was cancelled before its outcome was inspected.
    TaskCancelled,
    /// A panic escaped the worker's execution frame outside the tracked wrapper.
    ThreadFault,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TaskFailure => "task failure",
            FailureKind::TaskCancelled => "task cancelled",
            FailureKind::ThreadFault => "thread fault",
        };
        f.write_str(name)
    }
}

/// The cancellation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cancelled;

impl Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("task was cancelled")
    }
}

impl StdError for Cancelled {}

/// A captured panic. Keeps the original payload so it can be re-raised.
pub struct PanicPayload {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl PanicPayload {
    pub fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else if let Some(e) = payload.downcast_ref::<anyhow::Error>() {
            e.to_string()
        } else {
            "unknown panic".to_string()
        };

        PanicPayload {
            message,
            payload: Mutex::new(Some(payload)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Takes the original payload out. Returns `None` once taken.
    pub fn take(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicPayload")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panicked: {}", self.message)
    }
}

impl StdError for PanicPayload {}

/// The original cause of a [`PropagatedFailure`].
#[derive(Debug)]
pub enum Cause {
    Error(anyhow::Error),
    Cancelled(Cancelled),
    Panic(PanicPayload),
}

impl Cause {
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        match self {
            Cause::Error(e) => &**e,
            Cause::Cancelled(c) => c,
            Cause::Panic(p) => p,
        }
    }
}

impl Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Error(e) => Display::fmt(e, f),
            Cause::Cancelled(c) => Display::fmt(c, f),
            Cause::Panic(p) => Display::fmt(p, f),
        }
    }
}

/// The single failure type the pool raises, whichever path detected it.
///
/// The original cause is kept as-is and exposed through [`StdError::source`],
/// so error chains survive the trip through the pool.
#[derive(Debug)]
pub struct PropagatedFailure {
    kind: FailureKind,
    message: String,
    cause: Cause,
    thread: Option<String>,
}

impl PropagatedFailure {
    pub(crate) fn task_failed(error: anyhow::Error) -> Self {
        PropagatedFailure {
            kind: FailureKind::TaskFailure,
            message: error.to_string(),
            cause: Cause::Error(error),
            thread: current_thread_name(),
        }
    }

    pub(crate) fn task_panicked(payload: Box<dyn Any + Send + 'static>) -> Self {
        let payload = PanicPayload::new(payload);
        PropagatedFailure {
            kind: FailureKind::TaskFailure,
            message: payload.message().to_string(),
            cause: Cause::Panic(payload),
            thread: current_thread_name(),
        }
    }

    pub(crate) fn cancelled() -> Self {
        PropagatedFailure {
            kind: FailureKind::TaskCancelled,
            message: Cancelled.to_string(),
            cause: Cause::Cancelled(Cancelled),
            thread: current_thread_name(),
        }
    }

    pub(crate) fn thread_fault(payload: PanicPayload) -> Self {
        let thread = current_thread_name();
        let message = format!(
            "uncaught fault in thread {}: {}",
            thread.as_deref().unwrap_or("<unnamed>"),
            payload.message()
        );
        PropagatedFailure {
            kind: FailureKind::ThreadFault,
            message,
            cause: Cause::Panic(payload),
            thread,
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> &Cause {
        &self.cause
    }

    pub fn into_cause(self) -> Cause {
        self.cause
    }

    /// Name of the worker thread that raised this failure.
    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::TaskCancelled
    }

    /// Downcasts an error cause to its concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match &self.cause {
            Cause::Error(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Unwinds the current thread with this failure as the panic payload.
    ///
    /// Inside a pool worker the fault guard recognises the payload and routes
    /// it without logging or wrapping it a second time.
    pub fn raise(self) -> ! {
        panic::resume_unwind(Box::new(self))
    }
}

impl Display for PropagatedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for PropagatedFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.cause.as_error())
    }
}

fn current_thread_name() -> Option<String> {
    thread::current().name().map(str::to_string)
}
