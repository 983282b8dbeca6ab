//! Job executor controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use flowjob_config::{Config, ConfigValidator, ExecutorConfig};
use flowjob_store::{open_store, JobRecord, JobStore, JobType, UnitOfWork};

use crate::acquisition::{AcquisitionLoop, InFlightRegistry};
use crate::error::ExecutorError;
use crate::handler::{HandlerRegistry, JobHandler};
use crate::metrics::{ExecutorMetrics, MetricsSnapshot};
use crate::notifier::JobNotifier;
use crate::queue::DispatchQueue;
use crate::retry::{BackoffRetryPolicy, RetryPolicy};
use crate::worker;

/// Timing and policy values resolved from [`ExecutorConfig`].
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) queue_capacity: usize,
    pub(crate) workers: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) lock_duration: TimeDelta,
    pub(crate) enforce_exclusivity: bool,
}

/// State shared by the acquisition loop and the workers.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) unit_of_work: UnitOfWork,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
    pub(crate) metrics: Arc<ExecutorMetrics>,
    pub(crate) notifier: JobNotifier,
    pub(crate) in_flight: InFlightRegistry,
    pub(crate) node_id: String,
    pub(crate) settings: Settings,
}

struct Running {
    cancel: CancellationToken,
    queue: Arc<DispatchQueue>,
    tasks: Vec<JoinHandle<()>>,
}

/// Builder for [`JobExecutor`].
pub struct JobExecutorBuilder {
    store: Arc<dyn JobStore>,
    config: ExecutorConfig,
    handlers: HandlerRegistry,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl JobExecutorBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: ExecutorConfig::default(),
            handlers: HandlerRegistry::new(),
            retry_policy: None,
        }
    }

    /// Open the configured store and take the executor section of `config`.
    pub async fn from_config(config: &Config) -> Result<Self, ExecutorError> {
        let store = open_store(&config.store).await?;
        Ok(Self::new(store).config(config.executor.clone()))
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler<H>(mut self, job_type: impl Into<JobType>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.register(job_type, Arc::new(handler));
        self
    }

    pub fn handler_arc(mut self, job_type: impl Into<JobType>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.register(job_type, handler);
        self
    }

    /// Replace the default backoff policy built from the configuration.
    pub fn retry_policy<P>(mut self, policy: P) -> Self
    where
        P: RetryPolicy + 'static,
    {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn build(self) -> Result<JobExecutor, ExecutorError> {
        let validation = ConfigValidator::validate(&Config {
            executor: self.config.clone(),
            ..Default::default()
        })?;
        for warning in validation.into_result()? {
            warn!(path = %warning.path, "{}", warning.message);
        }

        let lock_duration = TimeDelta::from_std(self.config.lock_duration())
            .map_err(|e| ExecutorError::InvalidConfig(format!("lock_duration_ms: {}", e)))?;
        let settings = Settings {
            queue_capacity: self.config.queue_capacity,
            workers: self.config.workers,
            poll_interval: self.config.poll_interval(),
            lock_duration,
            enforce_exclusivity: self.config.enforce_exclusivity,
        };

        let node_id = self
            .config
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let notifier = JobNotifier::new();
        let unit_of_work =
            UnitOfWork::new(Arc::clone(&self.store)).with_listener(Arc::new(notifier.clone()));
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(BackoffRetryPolicy::from_config(&self.config.backoff)));

        let shared = Shared {
            store: self.store,
            unit_of_work,
            handlers: self.handlers,
            retry_policy,
            metrics: Arc::new(ExecutorMetrics::new()),
            notifier,
            in_flight: InFlightRegistry::default(),
            node_id,
            settings,
        };

        Ok(JobExecutor {
            shared: Arc::new(shared),
            default_retries: self.config.default_retries,
            running: Mutex::new(None),
        })
    }
}

/// Owns one acquisition loop and a fixed pool of workers.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use flowjob_executor::{JobExecutor, JobContext, JobError, JobHandler};
/// # use flowjob_store::{JobType, MemoryJobStore};
/// # struct TimerHandler;
/// # #[async_trait::async_trait]
/// # impl JobHandler for TimerHandler {
/// #     async fn execute(&self, _: &serde_json::Value, _: &mut JobContext) -> Result<(), JobError> { Ok(()) }
/// # }
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = JobExecutor::builder(Arc::new(MemoryJobStore::new()))
///     .handler(JobType::Timer, TimerHandler)
///     .build()?;
/// executor.start()?;
///
/// let mut tx = executor.unit_of_work().begin();
/// tx.insert_job(executor.new_job(JobType::Timer, serde_json::json!({"timer": "t1"})));
/// tx.commit().await?;
///
/// executor.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct JobExecutor {
    shared: Arc<Shared>,
    default_retries: u32,
    running: Mutex<Option<Running>>,
}

impl JobExecutor {
    pub fn builder(store: Arc<dyn JobStore>) -> JobExecutorBuilder {
        JobExecutorBuilder::new(store)
    }

    /// Spawn the acquisition loop and the workers. Must be called inside a Tokio runtime.
    pub fn start(&self) -> Result<(), ExecutorError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ExecutorError::AlreadyRunning);
        }

        let settings = &self.shared.settings;
        let queue = Arc::new(DispatchQueue::new(settings.queue_capacity));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(settings.workers + 1);

        let acquisition =
            AcquisitionLoop::new(Arc::clone(&self.shared), Arc::clone(&queue), cancel.clone());
        tasks.push(tokio::spawn(acquisition.run()));

        for id in 0..settings.workers {
            tasks.push(tokio::spawn(worker::run(
                id,
                Arc::clone(&self.shared),
                Arc::clone(&queue),
                cancel.child_token(),
            )));
        }

        self.shared.metrics.mark_start();
        info!(
            node_id = %self.shared.node_id,
            workers = settings.workers,
            queue_capacity = settings.queue_capacity,
            "Job executor started"
        );

        *running = Some(Running {
            cancel,
            queue,
            tasks,
        });
        Ok(())
    }

    /// Stop acquiring and wait for in-flight executions to finish.
    ///
    /// Jobs still queued keep their locks and become acquirable again once
    /// those expire.
    pub async fn stop(&self) -> Result<(), ExecutorError> {
        let running = self
            .running
            .lock()
            .take()
            .ok_or(ExecutorError::NotRunning)?;

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                error!(node_id = %self.shared.node_id, error = %e, "Executor task ended abnormally");
            }
        }

        let abandoned = running.queue.drain().await;
        for job in &abandoned {
            self.shared.in_flight.release(job);
        }
        if !abandoned.is_empty() {
            info!(
                count = abandoned.len(),
                "Queued jobs left locked, they are recovered after lock expiry"
            );
        }

        info!(node_id = %self.shared.node_id, "Job executor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Wake the acquisition loop. Signals raised before it wakes coalesce.
    pub fn job_was_added(&self) {
        self.shared.notifier.notify();
    }

    /// Unit of work whose commits wake this executor when they add due jobs.
    pub fn unit_of_work(&self) -> UnitOfWork {
        self.shared.unit_of_work.clone()
    }

    /// A job carrying the configured default retry budget.
    pub fn new_job(&self, job_type: impl Into<JobType>, payload: serde_json::Value) -> JobRecord {
        JobRecord::new(job_type, payload).with_retries(self.default_retries)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Jobs locked by this node and waiting for a worker.
    pub fn queued_jobs(&self) -> usize {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.queue.len())
            .unwrap_or(0)
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    pub fn notifier(&self) -> JobNotifier {
        self.shared.notifier.clone()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for JobExecutor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
