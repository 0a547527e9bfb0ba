//! SQLite-backed job store.
//!
//! Records survive process restart. The compare-and-swap contract of
//! [`JobStore::update`] is enforced by a single conditional `UPDATE`:
//!
//! ```sql
//! UPDATE jobs SET ... WHERE id = ? AND status = ? AND attempts = ?
//! ```
//!
//! Zero affected rows means either the job is gone (`NotFound`) or another
//! writer got there first (`Conflict`).
//!
//! ## Error Mapping
//!
//! | SQLx error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation) on insert | `AlreadyExists` |
//! | Any other database / pool / io error | `Unavailable` |
//! | Row that does not decode into a `JobRecord` | `Corrupt` |
//!
//! Timestamps are stored as RFC 3339 text with fixed nanosecond precision so
//! that lexical order equals chronological order.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use docket_core::{ExpectedState, JobId, JobRecord, JobStatus};

use super::store::{JobFilter, JobStats, JobStore, JobStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    status           TEXT NOT NULL,
    query            TEXT NOT NULL,
    file_ref         TEXT NOT NULL,
    filename         TEXT NULL,
    result           TEXT NULL,
    error_message    TEXT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    started_at       TEXT NULL,
    completed_at     TEXT NULL,
    duration_seconds REAL NULL
)
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS jobs_status_created_at ON jobs (status, created_at DESC);
CREATE INDEX IF NOT EXISTS jobs_created_at ON jobs (created_at DESC)
"#;

const COLUMNS: &str = "id, status, query, file_ref, filename, result, error_message, attempts, \
                       created_at, updated_at, started_at, completed_at, duration_seconds";

/// SQLite-backed job store.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://./docket.db`, and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| JobStoreError::Unavailable(format!("invalid database url '{url}': {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database (single connection; gone when dropped).
    pub async fn in_memory() -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| JobStoreError::Unavailable(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and ensure the schema exists.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, JobStoreError> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("create_schema", e))?;
        sqlx::raw_sql(INDEXES)
            .execute(&pool)
            .await
            .map_err(|e| map_sqlx_error("create_indexes", e))?;

        Ok(Self { pool })
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.id), err)]
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, query, file_ref, filename, result, error_message, attempts,
                created_at, updated_at, started_at, completed_at, duration_seconds
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.status.as_str())
        .bind(&record.query)
        .bind(&record.file_ref)
        .bind(&record.filename)
        .bind(&record.result)
        .bind(&record.error_message)
        .bind(i64::from(record.attempts))
        .bind(ts(record.created_at))
        .bind(ts(record.updated_at))
        .bind(record.started_at.map(ts))
        .bind(record.completed_at.map(ts))
        .bind(record.duration_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, expected = %expected), err)]
    async fn update(&self, record: &JobRecord, expected: ExpectedState) -> Result<(), JobStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?2,
                query = ?3,
                file_ref = ?4,
                filename = ?5,
                result = ?6,
                error_message = ?7,
                attempts = ?8,
                updated_at = ?9,
                started_at = ?10,
                completed_at = ?11,
                duration_seconds = ?12
            WHERE id = ?1
              AND status = ?13
              AND attempts = ?14
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.status.as_str())
        .bind(&record.query)
        .bind(&record.file_ref)
        .bind(&record.filename)
        .bind(&record.result)
        .bind(&record.error_message)
        .bind(i64::from(record.attempts))
        .bind(ts(record.updated_at))
        .bind(record.started_at.map(ts))
        .bind(record.completed_at.map(ts))
        .bind(record.duration_seconds)
        .bind(expected.status.as_str())
        .bind(i64::from(expected.attempts))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_job", e))?;

        if done.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(record.id).await? {
            None => Err(JobStoreError::NotFound(record.id)),
            Some(current) => Err(JobStoreError::Conflict {
                id: record.id,
                expected,
                actual: current.expected(),
            }),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(row_to_record).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: JobFilter, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.into_iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        let done = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        if done.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt)?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let status = JobStatus::from_str(&status).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats.record(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Corrupt(format!("invalid {column} '{value}': {e}")))
}

fn parse_opt_ts(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    value.map(|v| parse_ts(column, &v)).transpose()
}

fn corrupt(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Corrupt(err.to_string())
}

/// Map a database row into a `JobRecord`.
fn row_to_record(row: SqliteRow) -> Result<JobRecord, JobStoreError> {
    let id: String = row.try_get("id").map_err(corrupt)?;
    let id = JobId::from_str(&id).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;

    let status: String = row.try_get("status").map_err(corrupt)?;
    let status = JobStatus::from_str(&status).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;

    let attempts: i64 = row.try_get("attempts").map_err(corrupt)?;
    let attempts = u32::try_from(attempts)
        .map_err(|_| JobStoreError::Corrupt(format!("invalid attempts {attempts} for job {id}")))?;

    let created_at: String = row.try_get("created_at").map_err(corrupt)?;
    let updated_at: String = row.try_get("updated_at").map_err(corrupt)?;

    Ok(JobRecord {
        id,
        status,
        query: row.try_get("query").map_err(corrupt)?,
        file_ref: row.try_get("file_ref").map_err(corrupt)?,
        filename: row.try_get("filename").map_err(corrupt)?,
        result: row.try_get("result").map_err(corrupt)?,
        error_message: row.try_get("error_message").map_err(corrupt)?,
        attempts,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        started_at: parse_opt_ts("started_at", row.try_get("started_at").map_err(corrupt)?)?,
        completed_at: parse_opt_ts("completed_at", row.try_get("completed_at").map_err(corrupt)?)?,
        duration_seconds: row.try_get("duration_seconds").map_err(corrupt)?,
    })
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("timed out waiting for a connection in {operation}"))
        }
        other => JobStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
