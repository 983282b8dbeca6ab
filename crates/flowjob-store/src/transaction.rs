//! Unit of work over a [`JobStore`].
//!
//! Writes staged on a [`Transaction`] reach the store in one atomic batch on
//! commit. Callbacks registered with [`Transaction::on_commit`] run only after
//! that batch is durable, and never after a rollback.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{ExceptionInfo, JobId, JobRecord};
use crate::store::{JobStore, JobWrite};

/// Told that a job which is already due became visible in the store.
pub trait JobAddedListener: Send + Sync {
    fn job_was_added(&self);
}

type CommitHook = Box<dyn FnOnce() + Send + 'static>;

/// Opens transactions against one store and wires up the job-added listener.
#[derive(Clone)]
pub struct UnitOfWork {
    store: Arc<dyn JobStore>,
    listener: Option<Arc<dyn JobAddedListener>>,
}

impl UnitOfWork {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobAddedListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn begin(&self) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            store: Arc::clone(&self.store),
            listener: self.listener.clone(),
            writes: Vec::new(),
            hooks: Vec::new(),
            wake_registered: false,
        }
    }

    /// Run `work` in a fresh transaction, committing on `Ok` and rolling back on `Err`.
    pub async fn run_in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut Transaction) -> BoxFuture<'a, Result<T, E>>,
        E: From<StoreError>,
    {
        let mut tx = self.begin();
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

/// Staged job writes plus post-commit callbacks.
///
/// Dropping a transaction without committing discards everything staged on it.
pub struct Transaction {
    id: Uuid,
    store: Arc<dyn JobStore>,
    listener: Option<Arc<dyn JobAddedListener>>,
    writes: Vec<JobWrite>,
    hooks: Vec<CommitHook>,
    wake_registered: bool,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stage a new job. A job that is already due wakes the executor after commit.
    pub fn insert_job(&mut self, job: JobRecord) -> JobId {
        let id = job.id;
        let due = job.is_due(Utc::now());
        self.writes.push(JobWrite::Insert(job));
        if due {
            self.register_wake();
        }
        id
    }

    pub fn delete_job(&mut self, id: JobId, expected_version: u64) {
        self.writes.push(JobWrite::Delete {
            id,
            expected_version,
        });
    }

    pub fn reschedule_after_failure(
        &mut self,
        id: JobId,
        expected_version: u64,
        due_at: DateTime<Utc>,
        retries_remaining: u32,
        exception: ExceptionInfo,
    ) {
        self.writes.push(JobWrite::RescheduleAfterFailure {
            id,
            expected_version,
            due_at,
            retries_remaining,
            exception,
        });
        if due_at <= Utc::now() {
            self.register_wake();
        }
    }

    pub fn move_to_dead_letter(&mut self, id: JobId, expected_version: u64, exception: ExceptionInfo) {
        self.writes.push(JobWrite::MoveToDeadLetter {
            id,
            expected_version,
            exception,
        });
    }

    /// Run `hook` once this transaction has committed.
    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    pub fn staged_writes(&self) -> &[JobWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.hooks.is_empty()
    }

    fn register_wake(&mut self) {
        if self.wake_registered {
            return;
        }
        if let Some(listener) = self.listener.clone() {
            self.wake_registered = true;
            self.on_commit(move || listener.job_was_added());
        }
    }

    /// Apply staged writes atomically, then run the commit callbacks in order.
    pub async fn commit(self) -> Result<(), StoreError> {
        let Transaction {
            id,
            store,
            writes,
            hooks,
            ..
        } = self;

        let write_count = writes.len();
        if !writes.is_empty() {
            store.apply(writes).await?;
        }
        debug!(tx = %id, writes = write_count, hooks = hooks.len(), "Transaction committed");

        for hook in hooks {
            hook();
        }
        Ok(())
    }

    pub fn rollback(self) {
        debug!(tx = %self.id, writes = self.writes.len(), "Transaction rolled back");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("writes", &self.writes.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;
