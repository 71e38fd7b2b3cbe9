use std::num::NonZeroUsize;
use std::thread;

use crate::error::{PoolError, Result};
use crate::observer::FailureObserver;

const MAX_THREADS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub threads: u32,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    pub observer: FailureObserver,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
            .min(MAX_THREADS as usize) as u32;

        Self {
            threads,
            thread_name_prefix: "failfast-worker".to_string(),
            stack_size: None,
            observer: FailureObserver::default(),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(PoolError::invalid("threads must be >= 1"));
        }
        if self.threads > MAX_THREADS {
            return Err(PoolError::invalid(format!(
                "threads too large (max {})",
                MAX_THREADS
            )));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(PoolError::invalid("thread_name_prefix must not be empty"));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(PoolError::invalid(
                "thread_name_prefix must not contain null bytes",
            ));
        }

        if self.stack_size == Some(0) {
            return Err(PoolError::invalid("stack_size must be > 0"));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn threads(mut self, n: u32) -> Self {
        self.config.threads = n;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn observer(mut self, observer: FailureObserver) -> Self {
        self.config.observer = observer;
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
