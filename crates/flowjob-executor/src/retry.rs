//! Retry policy applied when a handler fails.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use flowjob_config::{BackoffConfig, BackoffStrategy};
use flowjob_store::JobRecord;

use crate::handler::JobError;

/// What happens to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Unlock the job and make it due again.
    Retry {
        due_at: DateTime<Utc>,
        retries_remaining: u32,
    },
    /// Move the job to dead-letter storage.
    DeadLetter,
}

/// Decides how a failed job continues.
pub trait RetryPolicy: Send + Sync {
    fn on_failure(&self, job: &JobRecord, error: &JobError, now: DateTime<Utc>) -> RetryDecision;
}

/// Decrements the retry budget and backs off between attempts.
#[derive(Debug, Clone)]
pub struct BackoffRetryPolicy {
    strategy: BackoffStrategy,
    increment: Duration,
    max_delay: Duration,
}

impl BackoffRetryPolicy {
    pub fn new(strategy: BackoffStrategy, increment: Duration, max_delay: Duration) -> Self {
        Self {
            strategy,
            increment,
            max_delay,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Fixed, delay, delay)
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.strategy, config.increment(), config.max_delay())
    }

    /// Delay before the retry following failure number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => Some(self.increment),
            BackoffStrategy::Linear => self.increment.checked_mul(attempt),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.increment.checked_mul(factor)),
        };
        delay.map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for BackoffRetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn on_failure(&self, job: &JobRecord, error: &JobError, now: DateTime<Utc>) -> RetryDecision {
        let retries_remaining = job.retries_remaining.saturating_sub(1);
        if error.is_fatal() || retries_remaining == 0 {
            return RetryDecision::DeadLetter;
        }

        let delay = TimeDelta::from_std(self.delay_for(job.failures + 1)).unwrap_or(TimeDelta::MAX);
        RetryDecision::Retry {
            due_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
            retries_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowjob_store::JobType;

    fn job(retries: u32, failures: u32) -> JobRecord {
        let mut job = JobRecord::new(JobType::Timer, serde_json::json!(null)).with_retries(retries);
        job.failures = failures;
        job
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffRetryPolicy::new(
            BackoffStrategy::Fixed,
            Duration::from_secs(10),
            Duration::from_secs(60),
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn test_linear_backoff_capped() {
        let policy = BackoffRetryPolicy::new(
            BackoffStrategy::Linear,
            Duration::from_secs(10),
            Duration::from_secs(25),
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(25));
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = BackoffRetryPolicy::new(
            BackoffStrategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_decrements_and_delays() {
        let policy = BackoffRetryPolicy::fixed(Duration::from_secs(10));
        let now = Utc::now();

        let decision = policy.on_failure(&job(3, 0), &JobError::failed("boom"), now);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                due_at: now + TimeDelta::seconds(10),
                retries_remaining: 2,
            }
        );
    }

    #[test]
    fn test_last_retry_dead_letters() {
        let policy = BackoffRetryPolicy::default();
        let decision = policy.on_failure(&job(1, 2), &JobError::failed("boom"), Utc::now());
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[test]
    fn test_fatal_dead_letters_immediately() {
        let policy = BackoffRetryPolicy::default();
        let decision = policy.on_failure(&job(3, 0), &JobError::fatal("bad payload"), Utc::now());
        assert_eq!(decision, RetryDecision::DeadLetter);
    }

    #[test]
    fn test_zero_retries_dead_letters() {
        let policy = BackoffRetryPolicy::default();
        let decision = policy.on_failure(&job(0, 0), &JobError::failed("boom"), Utc::now());
        assert_eq!(decision, RetryDecision::DeadLetter);
    }
}
