// failfast-pool: a fixed-size worker pool that never swallows a worker failure

pub mod config;
pub mod error;
pub mod failure;
pub mod observer;
pub mod task;
pub mod thread_pool;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::{PoolError, Result};
pub use failure::{Cancelled, Cause, FailureKind, PanicPayload, PropagatedFailure};
pub use observer::FailureObserver;
pub use task::{CancelToken, TaskHandle};
pub use thread_pool::FailFastThreadPool;

#[cfg(test)]
pub mod tests;
