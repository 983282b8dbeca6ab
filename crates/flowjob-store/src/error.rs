//! Store errors.

use thiserror::Error;

use crate::job::JobId;

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored version no longer matches, or the row is gone.
    #[error("Version conflict on job {0}")]
    Conflict(JobId),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// A job with this id already exists.
    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Misconfigured store.
    #[error("Store configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Lost an optimistic-locking race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => {
                StoreError::Unavailable("connection closed".to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}
