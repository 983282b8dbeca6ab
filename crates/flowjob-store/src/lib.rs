//! # flowjob Store
//!
//! Persisted job records and the store contract the job executor runs on.
//!
//! ## Features
//!
//! - Job record model with optimistic versioning
//! - [`JobStore`] contract: due-job queries, version-conditioned locking,
//!   atomic write batches and dead-letter storage
//! - In-memory store for single-process deployments and tests
//! - SQLite store that several processes can share
//! - Unit of work with post-commit callbacks

#[cfg(test)]
mod contract_tests;
pub mod error;
pub mod job;
pub mod memory;
mod schema;
pub mod sqlite;
pub mod store;
pub mod transaction;

use std::sync::Arc;

use flowjob_config::{StoreBackend, StoreConfig};

pub use error::StoreError;
pub use job::{DeadLetterRecord, ExceptionInfo, JobId, JobRecord, JobType, DEFAULT_RETRIES};
pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;
pub use store::{ExclusivityFilter, JobStore, JobWrite, LockOutcome};
pub use transaction::{JobAddedListener, Transaction, UnitOfWork};

/// Open the store selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
        StoreBackend::Sqlite => {
            let path = config.path.as_deref().ok_or_else(|| {
                StoreError::Config("sqlite backend requires store.path".to_string())
            })?;
            Ok(Arc::new(SqliteJobStore::open(path).await?))
        }
    }
}
