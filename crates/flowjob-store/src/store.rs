//! The job store contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::job::{DeadLetterRecord, ExceptionInfo, JobId, JobRecord};

/// Result of a conditional lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock is held. `version` is the job's version after locking.
    Acquired { version: u64 },
    /// Another writer changed the job first.
    Conflict,
}

/// Correlation rules applied when selecting due jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExclusivityFilter {
    /// Ignore correlation ids.
    #[default]
    Disabled,
    /// Skip a candidate when another job of its correlation holds a live lock
    /// or runs on the calling node, and either of the two is exclusive.
    /// `in_flight` maps each correlation id running locally to whether any of
    /// those jobs is exclusive.
    Enforced { in_flight: HashMap<String, bool> },
}

impl ExclusivityFilter {
    pub fn enforced() -> Self {
        Self::Enforced {
            in_flight: HashMap::new(),
        }
    }

    pub fn with_in_flight(in_flight: impl IntoIterator<Item = (String, bool)>) -> Self {
        Self::Enforced {
            in_flight: in_flight.into_iter().collect(),
        }
    }

    pub fn is_enforced(&self) -> bool {
        matches!(self, Self::Enforced { .. })
    }
}

/// One staged change. A batch of writes is applied all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum JobWrite {
    Insert(JobRecord),
    Delete {
        id: JobId,
        expected_version: u64,
    },
    /// Clear the lock, record the failure and make the job due again at `due_at`.
    RescheduleAfterFailure {
        id: JobId,
        expected_version: u64,
        due_at: DateTime<Utc>,
        retries_remaining: u32,
        exception: ExceptionInfo,
    },
    MoveToDeadLetter {
        id: JobId,
        expected_version: u64,
        exception: ExceptionInfo,
    },
}

impl JobWrite {
    pub fn job_id(&self) -> JobId {
        match self {
            JobWrite::Insert(job) => job.id,
            JobWrite::Delete { id, .. }
            | JobWrite::RescheduleAfterFailure { id, .. }
            | JobWrite::MoveToDeadLetter { id, .. } => *id,
        }
    }
}

/// Persistent job storage shared by every executor node.
///
/// Every mutation of an existing job is conditioned on the caller's expected
/// version. A mismatch surfaces as [`LockOutcome::Conflict`] or
/// [`StoreError::Conflict`] and never partially applies.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Due, acquirable jobs ordered by due time, at most `batch_size` of them.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        filter: &ExclusivityFilter,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Lock a job if its version still equals `expected_version`.
    async fn try_lock(
        &self,
        id: JobId,
        expected_version: u64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockOutcome, StoreError>;

    /// Apply a batch of writes atomically.
    async fn apply(&self, writes: Vec<JobWrite>) -> Result<(), StoreError>;

    /// Earliest instant after `now` at which some job becomes acquirable.
    async fn next_due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Dead letters, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError>;

    /// Move a dead letter back into the active set with a fresh retry budget.
    async fn resubmit_dead_letter(&self, id: JobId, retries: u32)
        -> Result<JobRecord, StoreError>;

    /// Number of jobs not dead-lettered.
    async fn active_count(&self) -> Result<usize, StoreError>;

    async fn insert(&self, job: JobRecord) -> Result<(), StoreError> {
        self.apply(vec![JobWrite::Insert(job)]).await
    }

    async fn delete(&self, id: JobId, expected_version: u64) -> Result<(), StoreError> {
        self.apply(vec![JobWrite::Delete {
            id,
            expected_version,
        }])
        .await
    }

    async fn reschedule_after_failure(
        &self,
        id: JobId,
        expected_version: u64,
        due_at: DateTime<Utc>,
        retries_remaining: u32,
        exception: ExceptionInfo,
    ) -> Result<(), StoreError> {
        self.apply(vec![JobWrite::RescheduleAfterFailure {
            id,
            expected_version,
            due_at,
            retries_remaining,
            exception,
        }])
        .await
    }

    async fn move_to_dead_letter(
        &self,
        id: JobId,
        expected_version: u64,
        exception: ExceptionInfo,
    ) -> Result<(), StoreError> {
        self.apply(vec![JobWrite::MoveToDeadLetter {
            id,
            expected_version,
            exception,
        }])
        .await
    }
}

/// Pick up to `limit` jobs from acquirable `candidates` (already in due order).
///
/// `live_locks` maps each correlation id with a live-locked job to whether
/// any of those locked jobs is exclusive.
pub(crate) fn select_candidates(
    candidates: Vec<JobRecord>,
    live_locks: &HashMap<String, bool>,
    filter: &ExclusivityFilter,
    limit: usize,
) -> Vec<JobRecord> {
    let in_flight = match filter {
        ExclusivityFilter::Disabled => {
            return candidates.into_iter().take(limit).collect();
        }
        ExclusivityFilter::Enforced { in_flight } => in_flight,
    };

    let mut selected: Vec<JobRecord> = Vec::new();
    let mut picked: HashMap<String, bool> = HashMap::new();

    for job in candidates {
        if selected.len() >= limit {
            break;
        }
        if let Some(correlation) = &job.correlation_id {
            let clashes = |other_exclusive: Option<&bool>| match other_exclusive {
                Some(other) => *other || job.exclusive,
                None => false,
            };
            if clashes(live_locks.get(correlation))
                || clashes(in_flight.get(correlation))
                || clashes(picked.get(correlation))
            {
                continue;
            }
            let entry = picked.entry(correlation.clone()).or_insert(false);
            *entry |= job.exclusive;
        }
        selected.push(job);
    }

    selected
}

/// Sort key for due-order selection.
pub(crate) fn due_order(a: &JobRecord, b: &JobRecord) -> std::cmp::Ordering {
    a.due_at
        .cmp(&b.due_at)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}
