//! Job handlers and the registry that maps job types to them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use flowjob_store::{ExceptionInfo, JobId, JobRecord, JobType, Transaction};

/// Failure reported by a handler.
#[derive(Debug, Error)]
pub enum JobError {
    /// Recoverable, the job is retried while its budget lasts.
    #[error("{0}")]
    Failed(String),

    /// Not worth retrying, the job goes straight to dead-letter storage.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        JobError::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }

    pub fn to_exception(&self) -> ExceptionInfo {
        ExceptionInfo::from_error(self)
    }
}

/// What a handler sees of the job it runs.
///
/// The open transaction commits together with the job's completion, so
/// follow-up jobs scheduled through it appear only if the job succeeds.
pub struct JobContext {
    job_id: JobId,
    job_type: JobType,
    correlation_id: Option<String>,
    retries_remaining: u32,
    attempt: u32,
    lock_owner: String,
    transaction: Transaction,
}

impl JobContext {
    pub(crate) fn new(job: &JobRecord, lock_owner: &str, transaction: Transaction) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            correlation_id: job.correlation_id.clone(),
            retries_remaining: job.retries_remaining,
            attempt: job.failures + 1,
            lock_owner: lock_owner.to_string(),
            transaction,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    /// 1 on the first execution, incremented after every failure.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn lock_owner(&self) -> &str {
        &self.lock_owner
    }

    pub fn transaction(&mut self) -> &mut Transaction {
        &mut self.transaction
    }

    /// Schedule a follow-up job in the handler's transaction.
    pub fn schedule(&mut self, job: JobRecord) -> JobId {
        self.transaction.insert_job(job)
    }

    pub(crate) fn into_transaction(self) -> Transaction {
        self.transaction
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("correlation_id", &self.correlation_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, payload: &Value, ctx: &mut JobContext) -> Result<(), JobError>;
}

/// Handlers keyed by job type, fixed once the executor starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaces.
    pub fn register(
        &mut self,
        job_type: impl Into<JobType>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers.insert(job_type.into(), handler)
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &JobType) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowjob_store::{MemoryJobStore, UnitOfWork};

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn execute(&self, _payload: &Value, _ctx: &mut JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register(JobType::Timer, Arc::new(Noop)).is_none());
        assert!(registry.register("timer", Arc::new(Noop)).is_some());

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&JobType::Timer));
        assert!(registry.get(&JobType::Message).is_none());
    }

    #[test]
    fn test_job_error_kinds() {
        assert!(JobError::fatal("bad payload").is_fatal());
        assert!(!JobError::failed("timeout").is_fatal());

        let other: JobError = anyhow::anyhow!("connection refused").into();
        assert!(!other.is_fatal());
        assert_eq!(other.to_string(), "connection refused");
    }

    #[test]
    fn test_exception_from_anyhow_chain() {
        let err: JobError = anyhow::anyhow!("socket closed")
            .context("calling payment service")
            .into();
        let exception = err.to_exception();
        assert_eq!(exception.message, "calling payment service");
        assert!(exception.detail.unwrap().contains("socket closed"));
    }

    #[tokio::test]
    async fn test_context_schedules_into_transaction() {
        let uow = UnitOfWork::new(Arc::new(MemoryJobStore::new()));
        let job = JobRecord::new(JobType::Message, serde_json::json!(null))
            .with_correlation_id("proc-9");
        let mut ctx = JobContext::new(&job, "node-a", uow.begin());

        assert_eq!(ctx.correlation_id(), Some("proc-9"));
        assert_eq!(ctx.attempt(), 1);
        assert_eq!(ctx.lock_owner(), "node-a");

        ctx.schedule(JobRecord::new(JobType::Timer, serde_json::json!(null)));
        assert_eq!(ctx.into_transaction().staged_writes().len(), 1);
    }
}
