//! Job executor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Job executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Lock owner name written into acquired jobs. A random id is used when unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Dispatch queue capacity: how many locked jobs may wait for a worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Fallback poll interval of the acquisition loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long an acquired lock stays valid.
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    /// Retry budget given to newly created jobs.
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Serialize jobs sharing a correlation id.
    #[serde(default = "default_true")]
    pub enforce_exclusivity: bool,

    /// Expected upper bound of a handler run. Only used to validate `lock_duration_ms`.
    #[serde(default = "default_max_job_runtime_ms")]
    pub max_job_runtime_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_queue_capacity() -> usize {
    3
}

fn default_workers() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_lock_duration_ms() -> u64 {
    5 * 60 * 1000
}

fn default_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_job_runtime_ms() -> u64 {
    60_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_ms: default_lock_duration_ms(),
            default_retries: default_retries(),
            enforce_exclusivity: true,
            max_job_runtime_ms: default_max_job_runtime_ms(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lock duration as Duration.
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    /// Worst case time a job sits locked before its handler returns: the jobs
    /// queued ahead of it on each worker, plus its own run.
    pub fn worst_case_lock_hold(&self) -> Duration {
        let workers = self.workers.max(1);
        let rounds = self.queue_capacity.div_ceil(workers) as u64 + 1;
        Duration::from_millis(self.max_job_runtime_ms.saturating_mul(rounds))
    }
}

/// Backoff strategy applied between failed attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failure.
    #[default]
    Fixed,
    /// increment * failures
    Linear,
    /// increment * 2^(failures - 1)
    Exponential,
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,

    #[serde(default = "default_increment_ms")]
    pub increment_ms: u64,

    /// Cap for linear and exponential delays.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_increment_ms() -> u64 {
    10_000
}

fn default_max_delay_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            increment_ms: default_increment_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn increment(&self) -> Duration {
        Duration::from_millis(self.increment_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
