//! Acquisition loop: finds due jobs, locks them and feeds the dispatch queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowjob_store::{ExclusivityFilter, JobRecord, LockOutcome};

use crate::error::ExecutorError;
use crate::executor::Shared;
use crate::queue::DispatchQueue;

/// Correlation ids with jobs locked by this node and not yet finished.
#[derive(Debug, Default)]
pub(crate) struct InFlightRegistry {
    correlations: DashMap<String, InFlightCount>,
}

#[derive(Debug, Default, Clone, Copy)]
struct InFlightCount {
    jobs: usize,
    exclusive: usize,
}

impl InFlightRegistry {
    pub(crate) fn register(&self, job: &JobRecord) {
        if let Some(correlation) = &job.correlation_id {
            let mut count = self.correlations.entry(correlation.clone()).or_default();
            count.jobs += 1;
            if job.exclusive {
                count.exclusive += 1;
            }
        }
    }

    pub(crate) fn release(&self, job: &JobRecord) {
        let Some(correlation) = &job.correlation_id else {
            return;
        };
        if let Some(mut count) = self.correlations.get_mut(correlation) {
            count.jobs = count.jobs.saturating_sub(1);
            if job.exclusive {
                count.exclusive = count.exclusive.saturating_sub(1);
            }
        }
        self.correlations.remove_if(correlation, |_, count| count.jobs == 0);
    }

    /// Correlation id paired with whether any of its in-flight jobs is exclusive.
    pub(crate) fn snapshot(&self) -> Vec<(String, bool)> {
        self.correlations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().exclusive > 0))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.correlations.len()
    }
}

/// Result of one acquisition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// No free slot, nothing was queried.
    QueueFull,
    /// `saturated` is set when the store returned a full batch, so more
    /// work is probably waiting.
    Acquired { locked: usize, saturated: bool },
}

pub(crate) struct AcquisitionLoop {
    shared: Arc<Shared>,
    queue: Arc<DispatchQueue>,
    cancel: CancellationToken,
}

impl AcquisitionLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        queue: Arc<DispatchQueue>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            queue,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        info!(node_id = %self.shared.node_id, "Acquisition loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.shared.metrics.record_cycle();

            match self.acquire_once().await {
                Ok(Cycle::QueueFull) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        result = self.queue.wait_for_space() => {
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Ok(Cycle::Acquired {
                    saturated: true, ..
                }) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(Cycle::Acquired { .. }) => {}
                Err(ExecutorError::QueueClosed) => break,
                Err(e @ ExecutorError::InvalidConfig(_)) => {
                    error!(node_id = %self.shared.node_id, error = %e, "Cannot lock jobs");
                }
                Err(e) => {
                    self.shared.metrics.record_store_error();
                    warn!(node_id = %self.shared.node_id, error = %e, "Job acquisition failed");
                }
            }

            let wait = self.next_wait().await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.shared.notifier.notified() => {
                    self.shared.metrics.record_wakeup();
                    debug!("Acquisition woken by notifier");
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(node_id = %self.shared.node_id, "Acquisition loop stopped");
    }

    /// Lock up to the queue's free capacity of due jobs and enqueue them.
    pub(crate) async fn acquire_once(&self) -> Result<Cycle, ExecutorError> {
        let free = self.queue.free_capacity();
        if free == 0 {
            return Ok(Cycle::QueueFull);
        }

        let now = Utc::now();
        let filter = if self.shared.settings.enforce_exclusivity {
            ExclusivityFilter::with_in_flight(self.shared.in_flight.snapshot())
        } else {
            ExclusivityFilter::Disabled
        };

        let expires_at = lock_expiry(now, self.shared.settings.lock_duration)?;
        let candidates = self.shared.store.find_due(now, free, &filter).await?;
        let saturated = candidates.len() >= free;
        let mut locked = 0;

        for mut job in candidates {
            let outcome = self
                .shared
                .store
                .try_lock(job.id, job.version, &self.shared.node_id, expires_at)
                .await?;

            match outcome {
                LockOutcome::Acquired { version } => {
                    job.version = version;
                    job.lock_owner = Some(self.shared.node_id.clone());
                    job.lock_expires_at = Some(expires_at);

                    debug!(job_id = %job.id, job_type = %job.job_type, "Job locked");
                    self.shared.in_flight.register(&job);
                    self.shared.metrics.record_acquired();
                    locked += 1;

                    if let Err(e) = self.queue.push(job.clone()).await {
                        self.shared.in_flight.release(&job);
                        return Err(e);
                    }
                }
                LockOutcome::Conflict => {
                    self.shared.metrics.record_lock_conflict();
                    debug!(job_id = %job.id, "Lock conflict, job taken by another node");
                }
            }
        }

        Ok(Cycle::Acquired { locked, saturated })
    }

    /// Sleep until the poll interval elapses or the next known job is due.
    async fn next_wait(&self) -> Duration {
        let poll = self.shared.settings.poll_interval;
        let now = Utc::now();

        match self.shared.store.next_due_at(now).await {
            Ok(Some(next)) => (next - now).to_std().unwrap_or(Duration::ZERO).min(poll),
            Ok(None) => poll,
            Err(e) => {
                self.shared.metrics.record_store_error();
                warn!(error = %e, "Could not read next due time");
                poll
            }
        }
    }
}

/// Expiry of a lock taken at `now`.
pub(crate) fn lock_expiry(
    now: DateTime<Utc>,
    lock_duration: TimeDelta,
) -> Result<DateTime<Utc>, ExecutorError> {
    now.checked_add_signed(lock_duration).ok_or_else(|| {
        ExecutorError::InvalidConfig(format!(
            "lock duration of {} ms overflows the lock expiry",
            lock_duration.num_milliseconds()
        ))
    })
}

#[cfg(test)]
#[path = "acquisition_tests.rs"]
mod tests;
