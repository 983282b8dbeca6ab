//! SQLite job store.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::error::StoreError;
use crate::job::{DeadLetterRecord, ExceptionInfo, JobId, JobRecord, JobType};
use crate::schema::init_schema;
use crate::store::{select_candidates, ExclusivityFilter, JobStore, JobWrite, LockOutcome};

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;

const JOB_COLUMNS: &str = "id, job_type, payload, correlation_id, exclusive, due_at, lock_owner, \
     lock_expires_at, retries_remaining, failures, version, last_exception, created_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a write batch was turned down.
enum Rejected {
    Conflict(JobId),
    Duplicate(JobId),
}

impl From<Rejected> for StoreError {
    fn from(rejected: Rejected) -> Self {
        match rejected {
            Rejected::Conflict(id) => StoreError::Conflict(id),
            Rejected::Duplicate(id) => StoreError::AlreadyExists(id),
        }
    }
}

/// SQLite-based job store. Several processes may open the same database file.
pub struct SqliteJobStore {
    conn: Connection,
}

impl SqliteJobStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn).await
    }

    /// Open or create a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), "Opening sqlite job store");
        let conn = Connection::open(path)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            Ok(init_schema(conn)?)
        })
        .await?;

        Ok(Self { conn })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn json_error(err: serde_json::Error) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(err))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let id: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let lock_expires_at: Option<i64> = row.get(7)?;
    let version: i64 = row.get(10)?;
    let last_exception: Option<String> = row.get(11)?;

    Ok(JobRecord {
        id: id.parse().map_err(|e| conversion_error(0, e))?,
        job_type: JobType::from(job_type),
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e))?,
        correlation_id: row.get(3)?,
        exclusive: row.get(4)?,
        due_at: from_millis(5, row.get(5)?)?,
        lock_owner: row.get(6)?,
        lock_expires_at: lock_expires_at.map(|ms| from_millis(7, ms)).transpose()?,
        retries_remaining: row.get(8)?,
        failures: row.get(9)?,
        version: version as u64,
        last_exception: last_exception
            .map(|text| serde_json::from_str::<ExceptionInfo>(&text))
            .transpose()
            .map_err(|e| conversion_error(11, e))?,
        created_at: from_millis(12, row.get(12)?)?,
    })
}

fn dead_letter_from_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    let job: String = row.get(0)?;
    Ok(DeadLetterRecord {
        job: serde_json::from_str(&job).map_err(|e| conversion_error(0, e))?,
        dead_lettered_at: from_millis(1, row.get(1)?)?,
    })
}

fn insert_job(tx: &rusqlite::Transaction<'_>, job: &JobRecord) -> tokio_rusqlite::Result<usize> {
    let last_exception = job
        .last_exception
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(json_error)?;
    let payload = serde_json::to_string(&job.payload).map_err(json_error)?;

    let inserted = tx.execute(
        &format!(
            "INSERT INTO jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO NOTHING"
        ),
        params![
            job.id.to_string(),
            job.job_type.as_str(),
            payload,
            job.correlation_id,
            job.exclusive,
            to_millis(job.due_at),
            job.lock_owner,
            job.lock_expires_at.map(to_millis),
            job.retries_remaining,
            job.failures,
            job.version as i64,
            last_exception,
            to_millis(job.created_at),
        ],
    )?;
    Ok(inserted)
}

fn apply_write(
    tx: &rusqlite::Transaction<'_>,
    write: &JobWrite,
    now: i64,
) -> tokio_rusqlite::Result<Result<(), Rejected>> {
    match write {
        JobWrite::Insert(job) => {
            let dead = tx
                .prepare("SELECT 1 FROM dead_letters WHERE id = ?1")?
                .exists([job.id.to_string()])?;
            if dead || insert_job(tx, job)? == 0 {
                return Ok(Err(Rejected::Duplicate(job.id)));
            }
        }
        JobWrite::Delete {
            id,
            expected_version,
        } => {
            let deleted = tx.execute(
                "DELETE FROM jobs WHERE id = ?1 AND version = ?2",
                params![id.to_string(), *expected_version as i64],
            )?;
            if deleted == 0 {
                return Ok(Err(Rejected::Conflict(*id)));
            }
        }
        JobWrite::RescheduleAfterFailure {
            id,
            expected_version,
            due_at,
            retries_remaining,
            exception,
        } => {
            let exception = serde_json::to_string(exception).map_err(json_error)?;
            let updated = tx.execute(
                "UPDATE jobs
                 SET due_at = ?1, retries_remaining = ?2, last_exception = ?3,
                     lock_owner = NULL, lock_expires_at = NULL,
                     failures = failures + 1, version = version + 1
                 WHERE id = ?4 AND version = ?5",
                params![
                    to_millis(*due_at),
                    retries_remaining,
                    exception,
                    id.to_string(),
                    *expected_version as i64,
                ],
            )?;
            if updated == 0 {
                return Ok(Err(Rejected::Conflict(*id)));
            }
        }
        JobWrite::MoveToDeadLetter {
            id,
            expected_version,
            exception,
        } => {
            let job = tx
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1 AND version = ?2"),
                    params![id.to_string(), *expected_version as i64],
                    job_from_row,
                )
                .optional()?;
            let Some(mut job) = job else {
                return Ok(Err(Rejected::Conflict(*id)));
            };

            job.retries_remaining = 0;
            job.last_exception = Some(exception.clone());
            job.failures += 1;
            job.version += 1;
            job.clear_lock();

            tx.execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])?;
            tx.execute(
                "INSERT INTO dead_letters (id, job, dead_lettered_at) VALUES (?1, ?2, ?3)",
                params![
                    id.to_string(),
                    serde_json::to_string(&job).map_err(json_error)?,
                    now
                ],
            )?;
        }
    }
    Ok(Ok(()))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        filter: &ExclusivityFilter,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let now = to_millis(now);
        let filter = filter.clone();

        let jobs = self
            .conn
            .call(move |conn| {
                let acquirable = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE due_at <= ?1 AND (lock_owner IS NULL OR lock_expires_at < ?1)
                     ORDER BY due_at, created_at, id"
                );

                if !filter.is_enforced() {
                    let mut stmt = conn.prepare(&format!("{acquirable} LIMIT ?2"))?;
                    let jobs = stmt
                        .query_map(params![now, batch_size as i64], job_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(jobs);
                }

                let mut stmt = conn.prepare(&acquirable)?;
                let candidates = stmt
                    .query_map([now], job_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare(
                    "SELECT correlation_id, MAX(exclusive) FROM jobs
                     WHERE correlation_id IS NOT NULL
                       AND lock_owner IS NOT NULL AND lock_expires_at >= ?1
                     GROUP BY correlation_id",
                )?;
                let live_locks = stmt
                    .query_map([now], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;

                Ok(select_candidates(candidates, &live_locks, &filter, batch_size))
            })
            .await?;

        Ok(jobs)
    }

    async fn try_lock(
        &self,
        id: JobId,
        expected_version: u64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockOutcome, StoreError> {
        let owner = owner.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE jobs SET lock_owner = ?1, lock_expires_at = ?2, version = version + 1
                     WHERE id = ?3 AND version = ?4",
                    params![
                        owner,
                        to_millis(expires_at),
                        id.to_string(),
                        expected_version as i64
                    ],
                )?)
            })
            .await?;

        Ok(if updated == 1 {
            LockOutcome::Acquired {
                version: expected_version + 1,
            }
        } else {
            LockOutcome::Conflict
        })
    }

    async fn apply(&self, writes: Vec<JobWrite>) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                for write in &writes {
                    if let Err(rejected) = apply_write(&tx, write, now)? {
                        // Dropping the transaction rolls it back.
                        return Ok(Err(rejected));
                    }
                }
                tx.commit()?;
                Ok(Ok(()))
            })
            .await?
            .map_err(StoreError::from)
    }

    async fn next_due_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        let now = to_millis(now);
        let next = self
            .conn
            .call(move |conn| {
                let next: Option<i64> = conn.query_row(
                    "SELECT MIN(ready_at) FROM (
                         SELECT CASE
                             WHEN lock_owner IS NOT NULL AND lock_expires_at IS NOT NULL
                             THEN MAX(due_at, lock_expires_at + 1)
                             ELSE due_at
                         END AS ready_at
                         FROM jobs
                     ) WHERE ready_at > ?1",
                    [now],
                    |row| row.get(0),
                )?;
                Ok(next.map(|ms| from_millis(0, ms)).transpose()?)
            })
            .await?;

        Ok(next)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let job = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                        [id.to_string()],
                        job_from_row,
                    )
                    .optional()?)
            })
            .await?;

        Ok(job)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let records = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT job, dead_lettered_at FROM dead_letters
                     ORDER BY dead_lettered_at, id LIMIT ?1",
                )?;
                let records = stmt
                    .query_map([limit as i64], dead_letter_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records)
            })
            .await?;

        Ok(records)
    }

    async fn resubmit_dead_letter(
        &self,
        id: JobId,
        retries: u32,
    ) -> Result<JobRecord, StoreError> {
        let revived = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let record = tx
                    .query_row(
                        "SELECT job, dead_lettered_at FROM dead_letters WHERE id = ?1",
                        [id.to_string()],
                        dead_letter_from_row,
                    )
                    .optional()?;
                let Some(record) = record else {
                    return Ok(None);
                };

                let mut job = record.job;
                job.retries_remaining = retries;
                job.due_at = Utc::now();
                job.version += 1;
                job.clear_lock();

                tx.execute("DELETE FROM dead_letters WHERE id = ?1", [id.to_string()])?;
                insert_job(&tx, &job)?;
                tx.commit()?;
                Ok(Some(job))
            })
            .await?;

        revived.ok_or(StoreError::NotFound(id))
    }

    async fn active_count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
                Ok(count)
            })
            .await?;

        Ok(count as usize)
    }
}
