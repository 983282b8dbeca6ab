//! Executor metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Executor metrics.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    /// Acquisition cycles run.
    pub cycles: AtomicU64,

    /// Wake-ups delivered by the commit notifier.
    pub wakeups: AtomicU64,

    /// Jobs locked and queued by this node.
    pub jobs_acquired: AtomicU64,

    /// Lock attempts lost to another node.
    pub lock_conflicts: AtomicU64,

    /// Jobs whose completion found the lock already taken over.
    pub locks_lost: AtomicU64,

    pub jobs_succeeded: AtomicU64,

    /// Failures that were rescheduled.
    pub jobs_failed: AtomicU64,

    pub jobs_dead_lettered: AtomicU64,

    /// Jobs with no registered handler.
    pub unknown_job_types: AtomicU64,

    /// Store calls that failed for infrastructure reasons.
    pub store_errors: AtomicU64,

    pub handler_panics: AtomicU64,

    /// Total handler time (microseconds).
    pub execution_time_us: AtomicU64,

    start_time: parking_lot::RwLock<Option<Instant>>,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquired(&self) {
        self.jobs_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_lost(&self) {
        self.locks_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_type(&self) {
        self.unknown_job_types.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution_time(&self, duration_us: u64) {
        self.execution_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Get a snapshot of the metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.uptime_secs(),
            cycles: self.cycles.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            jobs_acquired: self.jobs_acquired.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            locks_lost: self.locks_lost.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
            unknown_job_types: self.unknown_job_types.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            execution_time_us: self.execution_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub cycles: u64,
    pub wakeups: u64,
    pub jobs_acquired: u64,
    pub lock_conflicts: u64,
    pub locks_lost: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub unknown_job_types: u64,
    pub store_errors: u64,
    pub handler_panics: u64,
    pub execution_time_us: u64,
}

impl MetricsSnapshot {
    /// Executions that reached a handler and finished, whatever the outcome.
    pub fn jobs_executed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.jobs_dead_lettered
    }

    /// Average handler time in milliseconds.
    pub fn avg_execution_time_ms(&self) -> f64 {
        let executed = self.jobs_executed();
        if executed == 0 {
            return 0.0;
        }
        (self.execution_time_us as f64 / executed as f64) / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ExecutorMetrics::new();
        metrics.record_cycle();
        metrics.record_acquired();
        metrics.record_acquired();
        metrics.record_succeeded();
        metrics.record_failed();
        metrics.record_dead_lettered();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.jobs_acquired, 2);
        assert_eq!(snapshot.jobs_executed(), 3);
    }

    #[test]
    fn test_uptime_before_start() {
        let metrics = ExecutorMetrics::new();
        assert_eq!(metrics.uptime_secs(), 0);
        metrics.mark_start();
        assert_eq!(metrics.uptime_secs(), 0);
    }

    #[test]
    fn test_avg_execution_time() {
        let metrics = ExecutorMetrics::new();
        assert_eq!(metrics.snapshot().avg_execution_time_ms(), 0.0);

        metrics.record_succeeded();
        metrics.record_succeeded();
        metrics.record_execution_time(4_000);
        assert_eq!(metrics.snapshot().avg_execution_time_ms(), 2.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ExecutorMetrics::new();
        metrics.record_unknown_type();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["unknown_job_types"], 1);
    }
}
