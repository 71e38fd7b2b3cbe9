use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors reported synchronously while building a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PoolError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        PoolError::InvalidConfiguration(msg.into())
    }
}
