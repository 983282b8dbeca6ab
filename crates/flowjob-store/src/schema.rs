//! Database schema management.

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// Timestamps are unix milliseconds.
const SCHEMA: &str = r#"
-- Active jobs
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    correlation_id TEXT,
    exclusive INTEGER NOT NULL DEFAULT 0,
    due_at INTEGER NOT NULL,
    lock_owner TEXT,
    lock_expires_at INTEGER,
    retries_remaining INTEGER NOT NULL,
    failures INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL,
    last_exception TEXT,
    created_at INTEGER NOT NULL
);

-- Jobs whose retries are exhausted, stored whole as JSON
CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    job TEXT NOT NULL,
    dead_lettered_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(due_at);
CREATE INDEX IF NOT EXISTS idx_jobs_correlation ON jobs(correlation_id);
CREATE INDEX IF NOT EXISTS idx_dead_letters_at ON dead_letters(dead_lettered_at);
"#;
