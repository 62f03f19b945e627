//! Durable request queue backed by SQLite.
//!
//! The store is the single source of truth for job state. It is safe for
//! concurrent readers plus one writer (the scheduler's worker); status
//! transitions are conditional updates on the expected prior status, so even
//! a second writer cannot take an illegal edge.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Job, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("conversation id already bound for job {0}")]
    AlreadyBound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Selection predicate used by `select_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Power and schedule gated: `estimated_power <= available` and
    /// `estimated_completion <= now`.
    Scheduled,
    /// First queued job regardless of power estimate or schedule.
    Immediate,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    conversation_id TEXT,
    prompt TEXT NOT NULL,
    submitted_at TEXT NOT NULL,
    estimated_power REAL NOT NULL,
    estimated_completion TEXT NOT NULL,
    status TEXT NOT NULL,
    response TEXT
)
"#;

#[derive(Clone)]
pub struct RequestStore {
    pool: SqlitePool,
}

impl RequestStore {
    /// Open (and create if missing) the queue database at `db_path`.
    pub async fn connect(db_path: &str) -> Result<Self, StoreError> {
        // An in-memory database lives inside a single connection; keep the
        // pool at exactly one so every caller sees the same data.
        let pool = if db_path == ":memory:" {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
            }
            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Create a record in `queued` state and return its id.
    pub async fn enqueue(
        &self,
        conversation_id: Option<&str>,
        prompt: &str,
        estimated_power: f64,
        estimated_completion: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO requests \
             (id, conversation_id, prompt, submitted_at, estimated_power, \
              estimated_completion, status, response) \
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(prompt)
        .bind(format_timestamp(Utc::now()))
        .bind(estimated_power)
        .bind(format_timestamp(estimated_completion))
        .bind(JobStatus::Queued.to_string())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Attach a conversation id after the fact. Assignable exactly once.
    pub async fn bind_conversation(
        &self,
        job_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE requests SET conversation_id = ? \
             WHERE id = ? AND conversation_id IS NULL",
        )
        .bind(conversation_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(job_id).await? {
                Some(_) => Err(StoreError::AlreadyBound(job_id.to_string())),
                None => Err(StoreError::NotFound(job_id.to_string())),
            };
        }
        Ok(())
    }

    /// Deterministically pick the earliest runnable job. Read-only.
    ///
    /// Ties on `submitted_at` fall back to the lexicographically smallest id
    /// so the choice is total.
    pub async fn select_next(
        &self,
        available_power: f64,
        now: DateTime<Utc>,
        mode: SelectionMode,
    ) -> Result<Option<Job>, StoreError> {
        let row = match mode {
            SelectionMode::Immediate => {
                sqlx::query(
                    "SELECT * FROM requests WHERE status = 'queued' \
                     ORDER BY submitted_at ASC, id ASC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
            }
            SelectionMode::Scheduled => {
                sqlx::query(
                    "SELECT * FROM requests WHERE status = 'queued' \
                     AND estimated_power <= ? AND estimated_completion <= ? \
                     ORDER BY submitted_at ASC, id ASC LIMIT 1",
                )
                .bind(available_power)
                .bind(format_timestamp(now))
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Atomic status change along one of the allowed edges. The update is
    /// conditional on the expected prior status; `response` is written iff
    /// the new status is terminal.
    pub async fn transition(
        &self,
        job_id: &str,
        new_status: JobStatus,
        response: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = match new_status {
            JobStatus::Processing => {
                sqlx::query(
                    "UPDATE requests SET status = 'processing' \
                     WHERE id = ? AND status = 'queued'",
                )
                .bind(job_id)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Completed | JobStatus::Failed => {
                sqlx::query(
                    "UPDATE requests SET status = ?, response = ? \
                     WHERE id = ? AND status = 'processing'",
                )
                .bind(new_status.to_string())
                .bind(response.unwrap_or(""))
                .bind(job_id)
                .execute(&self.pool)
                .await?
            }
            JobStatus::Queued => {
                // Nothing transitions back into the queue.
                return match self.get(job_id).await? {
                    Some(job) => Err(StoreError::InvalidTransition {
                        from: job.status,
                        to: new_status,
                    }),
                    None => Err(StoreError::NotFound(job_id.to_string())),
                };
            }
        };

        if result.rows_affected() == 0 {
            return match self.get(job_id).await? {
                Some(job) => Err(StoreError::InvalidTransition {
                    from: job.status,
                    to: new_status,
                }),
                None => Err(StoreError::NotFound(job_id.to_string())),
            };
        }
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn list_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM requests WHERE conversation_id = ? \
             ORDER BY submitted_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn queue_length(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// 1-based position among queued jobs, None once the job left the queue.
    pub async fn queue_position(&self, job_id: &str) -> Result<Option<i64>, StoreError> {
        let position: Option<i64> = sqlx::query_scalar(
            "SELECT position FROM ( \
                SELECT id AS request_id, \
                       ROW_NUMBER() OVER (ORDER BY submitted_at ASC, id ASC) AS position \
                FROM requests WHERE status = 'queued' \
             ) WHERE request_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position)
    }

    /// Startup recovery: jobs stranded in `processing` by a crash are failed
    /// with an "interrupted" diagnostic before the worker starts.
    pub async fn sweep_interrupted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'failed', response = 'interrupted' \
             WHERE status = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339, tolerating naive timestamps with or without fractional
/// seconds (older rows were written that way).
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let submitted_at: String = row.try_get("submitted_at")?;
    let estimated_completion: String = row.try_get("estimated_completion")?;
    let status: String = row.try_get("status")?;

    Ok(Job {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        prompt: row.try_get("prompt")?,
        submitted_at: parse_timestamp(&submitted_at)?,
        estimated_power: row.try_get("estimated_power")?,
        estimated_completion: parse_timestamp(&estimated_completion)?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        response: row.try_get("response")?,
    })
}
