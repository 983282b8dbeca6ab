//! # flowjob Executor
//!
//! Runs persisted jobs for the process engine.
//!
//! ## Architecture
//!
//! ```text
//!            commit notifier
//!                  │
//!                  ▼
//! JobStore ──► Acquisition Loop ──► Dispatch Queue ──► Worker Pool ──► Handlers
//!    ▲            (lock)              (bounded)         (W tasks)        │
//!    └─────────────────── delete / reschedule / dead-letter ◄────────────┘
//! ```
//!
//! A single acquisition task finds due jobs, locks them with a
//! version-conditioned write and hands them to a fixed pool of workers
//! through a bounded queue. Several executors may share one store. Lock
//! expiry is the only recovery mechanism for jobs whose owner disappears.

mod acquisition;
pub mod error;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod notifier;
pub mod queue;
pub mod retry;
pub mod telemetry;
mod worker;

pub use error::ExecutorError;
pub use executor::{JobExecutor, JobExecutorBuilder};
pub use handler::{HandlerRegistry, JobContext, JobError, JobHandler};
pub use metrics::{ExecutorMetrics, MetricsSnapshot};
pub use notifier::JobNotifier;
pub use queue::DispatchQueue;
pub use retry::{BackoffRetryPolicy, RetryDecision, RetryPolicy};
pub use telemetry::init_tracing;
