//! Executor errors.

use thiserror::Error;

use flowjob_config::ConfigError;
use flowjob_store::StoreError;

/// Executor error types.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor is already running")]
    AlreadyRunning,

    #[error("Executor is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Dispatch queue closed")]
    QueueClosed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl From<ConfigError> for ExecutorError {
    fn from(err: ConfigError) -> Self {
        ExecutorError::InvalidConfig(err.to_string())
    }
}
