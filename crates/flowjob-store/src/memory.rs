//! In-memory job store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::job::{DeadLetterRecord, JobId, JobRecord};
use crate::store::{due_order, select_candidates, ExclusivityFilter, JobStore, JobWrite, LockOutcome};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    dead_letters: HashMap<JobId, DeadLetterRecord>,
}

impl Inner {
    /// Check a batch against current versions without touching state.
    fn check(&self, writes: &[JobWrite]) -> Result<(), StoreError> {
        // Version each job will have after earlier writes in the batch; None once removed.
        let mut overlay: HashMap<JobId, Option<u64>> = HashMap::new();

        for write in writes {
            let id = write.job_id();
            let current = match overlay.get(&id) {
                Some(version) => *version,
                None => self.jobs.get(&id).map(|job| job.version),
            };

            match write {
                JobWrite::Insert(job) => {
                    if current.is_some() || self.dead_letters.contains_key(&id) {
                        return Err(StoreError::AlreadyExists(id));
                    }
                    overlay.insert(id, Some(job.version));
                }
                JobWrite::Delete {
                    expected_version, ..
                }
                | JobWrite::MoveToDeadLetter {
                    expected_version, ..
                } => {
                    if current != Some(*expected_version) {
                        return Err(StoreError::Conflict(id));
                    }
                    overlay.insert(id, None);
                }
                JobWrite::RescheduleAfterFailure {
                    expected_version, ..
                } => {
                    if current != Some(*expected_version) {
                        return Err(StoreError::Conflict(id));
                    }
                    overlay.insert(id, Some(expected_version + 1));
                }
            }
        }

        Ok(())
    }

    fn write(&mut self, write: JobWrite, now: DateTime<Utc>) {
        match write {
            JobWrite::Insert(job) => {
                self.jobs.insert(job.id, job);
            }
            JobWrite::Delete { id, .. } => {
                self.jobs.remove(&id);
            }
            JobWrite::RescheduleAfterFailure {
                id,
                due_at,
                retries_remaining,
                exception,
                ..
            } => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.due_at = due_at;
                    job.retries_remaining = retries_remaining;
                    job.last_exception = Some(exception);
                    job.failures += 1;
                    job.version += 1;
                    job.clear_lock();
                }
            }
            JobWrite::MoveToDeadLetter { id, exception, .. } => {
                if let Some(mut job) = self.jobs.remove(&id) {
                    job.retries_remaining = 0;
                    job.last_exception = Some(exception);
                    job.failures += 1;
                    job.version += 1;
                    job.clear_lock();
                    self.dead_letters.insert(
                        id,
                        DeadLetterRecord {
                            job,
                            dead_lettered_at: now,
                        },
                    );
                }
            }
        }
    }
}

/// Job store held in process memory.
///
/// Every executor sharing one instance sees the same jobs, so it also serves
/// as a stand-in for a shared database in multi-node tests.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        filter: &ExclusivityFilter,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.inner.lock();

        let mut candidates: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|job| job.is_acquirable(now))
            .cloned()
            .collect();
        candidates.sort_by(due_order);

        let mut live_locks: HashMap<String, bool> = HashMap::new();
        if filter.is_enforced() {
            for job in inner.jobs.values().filter(|job| job.is_locked(now)) {
                if let Some(correlation) = &job.correlation_id {
                    *live_locks.entry(correlation.clone()).or_insert(false) |= job.exclusive;
                }
            }
        }

        Ok(select_candidates(candidates, &live_locks, filter, batch_size))
    }

    async fn try_lock(
        &self,
        id: JobId,
        expected_version: u64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockOutcome, StoreError> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.version == expected_version => {
                job.lock_owner = Some(owner.to_string());
                job.lock_expires_at = Some(expires_at);
                job.version += 1;
                Ok(LockOutcome::Acquired {
                    version: job.version,
                })
            }
            _ => Ok(LockOutcome::Conflict),
        }
    }

    async fn apply(&self, writes: Vec<JobWrite>) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.check(&writes)?;
        for write in writes {
            inner.write(write, now);
        }
        Ok(())
    }

    async fn next_due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .values()
            .map(JobRecord::acquirable_from)
            .filter(|at| *at > now)
            .min())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut records: Vec<DeadLetterRecord> = inner.dead_letters.values().cloned().collect();
        records.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn resubmit_dead_letter(
        &self,
        id: JobId,
        retries: u32,
    ) -> Result<JobRecord, StoreError> {
        let mut inner = self.inner.lock();
        let record = inner
            .dead_letters
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;

        let mut job = record.job;
        job.retries_remaining = retries;
        job.due_at = Utc::now();
        job.version += 1;
        job.clear_lock();
        inner.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().jobs.len())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
