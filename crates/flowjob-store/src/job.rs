//! Job record model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retries given to a job that does not ask for a different count.
pub const DEFAULT_RETRIES: u32 = 3;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of work a job performs. Handlers are registered per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    /// Fires a timer event on a waiting process instance.
    Timer,
    /// Continues a process instance past an asynchronous boundary.
    AsyncContinuation,
    /// Delivers a message to a process instance.
    Message,
    /// Application-defined job type.
    Custom(String),
}

impl JobType {
    /// Build a job type from its name. Built-in names map to their variants.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::from(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::Timer => "timer",
            JobType::AsyncContinuation => "async-continuation",
            JobType::Message => "message",
            JobType::Custom(name) => name,
        }
    }
}

impl From<String> for JobType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "timer" => JobType::Timer,
            "async-continuation" => JobType::AsyncContinuation,
            "message" => JobType::Message,
            _ => JobType::Custom(name),
        }
    }
}

impl From<&str> for JobType {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        match job_type {
            JobType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded on a job by its last unsuccessful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub message: String,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ExceptionInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Capture an error and its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut info = Self::new(err.to_string());
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        if !causes.is_empty() {
            info.detail = Some(causes.join("\n"));
        }
        info
    }
}

/// A persisted unit of deferred work.
///
/// `version` increases on every successful write. All conditional store
/// operations compare against it, which is what keeps two nodes from both
/// believing they own the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    /// Groups jobs that belong to the same process instance.
    pub correlation_id: Option<String>,
    /// An exclusive job never runs alongside another job of its correlation.
    pub exclusive: bool,
    pub due_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    pub version: u64,
    pub last_exception: Option<ExceptionInfo>,
    /// Number of failed executions so far.
    pub failures: u32,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a job that is due immediately.
    pub fn new(job_type: impl Into<JobType>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            correlation_id: None,
            exclusive: false,
            due_at: now,
            lock_owner: None,
            lock_expires_at: None,
            retries_remaining: DEFAULT_RETRIES,
            version: 0,
            last_exception: None,
            failures: 0,
            created_at: now,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = due_at;
        self
    }

    /// Make the job due `delay` from its creation time.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.due_at = self.created_at + delay;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    /// Held by a lock that has not yet expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(_), Some(expires_at)) => expires_at >= now,
            _ => false,
        }
    }

    /// Due and either unlocked or holding an expired lock.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.is_locked(now)
    }

    /// Earliest instant at which the job can be acquired, ignoring exclusivity.
    pub fn acquirable_from(&self) -> DateTime<Utc> {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(_), Some(expires_at)) => {
                self.due_at.max(expires_at + Duration::milliseconds(1))
            }
            _ => self.due_at,
        }
    }

    pub(crate) fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expires_at = None;
    }
}

/// A job whose retries are exhausted, kept for inspection and manual resubmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub job: JobRecord,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.job.last_exception.as_ref()
    }
}
