//! Worker tasks: run queued jobs through their handlers and settle the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use flowjob_store::{JobRecord, StoreError};

use crate::executor::Shared;
use crate::handler::{JobContext, JobError};
use crate::queue::DispatchQueue;
use crate::retry::RetryDecision;

/// Pull jobs until cancelled. A job already taken from the queue always
/// runs to completion before the worker checks for cancellation again.
pub(crate) async fn run(
    worker: usize,
    shared: Arc<Shared>,
    queue: Arc<DispatchQueue>,
    cancel: CancellationToken,
) {
    debug!(worker, "Worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.pop() => match job {
                Some(job) => job,
                None => break,
            },
        };

        process(worker, &shared, job).await;
    }

    debug!(worker, "Worker stopped");
}

pub(crate) async fn process(worker: usize, shared: &Shared, job: JobRecord) {
    execute(worker, shared, &job).await;

    shared.in_flight.release(&job);
    // Siblings held back by exclusivity may be acquirable now.
    if shared.settings.enforce_exclusivity && job.correlation_id.is_some() {
        shared.notifier.notify();
    }
}

async fn execute(worker: usize, shared: &Shared, job: &JobRecord) {
    let Some(handler) = shared.handlers.get(&job.job_type) else {
        shared.metrics.record_unknown_type();
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            worker,
            "No handler registered for job type, leaving job locked"
        );
        return;
    };

    if job.lock_expires_at.is_some_and(|expires_at| expires_at < Utc::now()) {
        shared.metrics.record_lock_lost();
        warn!(job_id = %job.id, worker, "Lock expired while queued, skipping job");
        return;
    }

    debug!(job_id = %job.id, job_type = %job.job_type, worker, "Executing job");
    let mut ctx = JobContext::new(job, &shared.node_id, shared.unit_of_work.begin());
    let started = Instant::now();

    let result = AssertUnwindSafe(handler.execute(&job.payload, &mut ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            shared.metrics.record_panic();
            Err(JobError::Failed(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
    shared.metrics.record_execution_time(elapsed_micros(started));

    match result {
        Ok(()) => {
            let mut tx = ctx.into_transaction();
            tx.delete_job(job.id, job.version);
            match tx.commit().await {
                Ok(()) => {
                    shared.metrics.record_succeeded();
                    debug!(job_id = %job.id, worker, "Job completed");
                }
                Err(e) => settle_error(shared, job, worker, e),
            }
        }
        Err(err) => {
            // Nothing the handler staged survives a failure.
            ctx.into_transaction().rollback();
            fail(worker, shared, job, err).await;
        }
    }
}

async fn fail(worker: usize, shared: &Shared, job: &JobRecord, err: JobError) {
    let exception = err.to_exception();
    let decision = shared.retry_policy.on_failure(job, &err, Utc::now());
    let mut tx = shared.unit_of_work.begin();

    match decision {
        RetryDecision::Retry {
            due_at,
            retries_remaining,
        } => {
            tx.reschedule_after_failure(job.id, job.version, due_at, retries_remaining, exception);
            match tx.commit().await {
                Ok(()) => {
                    shared.metrics.record_failed();
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        worker,
                        retries_remaining,
                        due_at = %due_at,
                        error = %err,
                        "Job failed, rescheduled"
                    );
                }
                Err(e) => settle_error(shared, job, worker, e),
            }
        }
        RetryDecision::DeadLetter => {
            tx.move_to_dead_letter(job.id, job.version, exception);
            match tx.commit().await {
                Ok(()) => {
                    shared.metrics.record_dead_lettered();
                    error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        worker,
                        error = %err,
                        "Job failed, moved to dead letters"
                    );
                }
                Err(e) => settle_error(shared, job, worker, e),
            }
        }
    }
}

/// A commit that did not go through. The job keeps whatever lock it has.
fn settle_error(shared: &Shared, job: &JobRecord, worker: usize, err: StoreError) {
    if err.is_conflict() {
        shared.metrics.record_lock_lost();
        warn!(job_id = %job.id, worker, "Lock lost to another node, outcome discarded");
    } else {
        shared.metrics.record_store_error();
        warn!(
            job_id = %job.id,
            worker,
            error = %err,
            "Store unavailable, job stays locked until its lock expires"
        );
    }
}

fn elapsed_micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
