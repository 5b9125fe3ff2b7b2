//! Durable job queue in `SQLite`.
//!
//! Delivery is at-least-once: a job is claimed by flipping it to `running`
//! and removed only after its handler succeeds. Jobs left `running` by a
//! crashed process are put back with [`JobQueue::recover`].

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, warn};

use super::Job;
use crate::Result;
use crate::config::JobsConfig;
use crate::db::{self, Database};

/// Row ID of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Waiting for `run_after`.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Gave up after `max_attempts`.
    Failed,
}

impl JobStatus {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    /// Queue row.
    pub id: JobId,
    /// Work to do.
    pub job: Job,
    /// Attempts including this one.
    pub attempts: u32,
    /// Attempts allowed.
    pub max_attempts: u32,
}

/// What happened to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled.
    Retry {
        /// Next attempt time.
        run_after: DateTime<Utc>,
    },
    /// Attempts exhausted; the job stays in the table as `failed`.
    Dead,
}

/// Queue of [`Job`]s shared by the scheduler, engines and workers.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: JobsConfig,
}

impl JobQueue {
    /// Creates a queue over the shared database.
    #[must_use]
    pub fn new(db: &Database, config: JobsConfig) -> Self {
        Self {
            pool: db.pool().clone(),
            config,
        }
    }

    /// Enqueues a job to run now.
    ///
    /// Returns `None` when a pending job with the same dedupe key already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn enqueue(&self, job: &Job) -> Result<Option<JobId>> {
        self.enqueue_at(job, Utc::now()).await
    }

    /// Enqueues a job to run no earlier than `run_after`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn enqueue_at(&self, job: &Job, run_after: DateTime<Utc>) -> Result<Option<JobId>> {
        let payload = serde_json::to_string(job)?;
        let dedupe_key = job.dedupe_key();
        let now = db::now();

        let id: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO jobs
                (name, payload, dedupe_key, status, attempts, max_attempts, run_after,
                 created_at, updated_at)
            SELECT ?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?6
            WHERE ?3 IS NULL
               OR NOT EXISTS (SELECT 1 FROM jobs WHERE dedupe_key = ?3 AND status = 'pending')
            RETURNING id
            ",
        )
        .bind(job.name())
        .bind(&payload)
        .bind(&dedupe_key)
        .bind(i64::from(self.config.max_attempts))
        .bind(db::timestamp(run_after))
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        match id {
            Some(id) => debug!(job = job.name(), id, "job enqueued"),
            None => debug!(job = job.name(), ?dedupe_key, "job already pending"),
        }
        Ok(id.map(JobId))
    }

    /// Claims the oldest due job.
    ///
    /// Rows whose payload no longer decodes are marked failed and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn claim(&self) -> Result<Option<ClaimedJob>> {
        loop {
            let row = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'running', attempts = attempts + 1, updated_at = ?1
                WHERE id = (
                    SELECT id FROM jobs
                    WHERE status = 'pending' AND run_after <= ?1
                    ORDER BY run_after ASC, id ASC
                    LIMIT 1
                )
                RETURNING id, payload, attempts, max_attempts
                ",
            )
            .bind(db::now())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id = JobId(row.get("id"));
            let payload: String = row.get("payload");
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => {
                    return Ok(Some(ClaimedJob {
                        id,
                        job,
                        attempts: to_u32(row.get("attempts")),
                        max_attempts: to_u32(row.get("max_attempts")),
                    }));
                }
                Err(e) => {
                    warn!(%id, error = %e, "undecodable job payload");
                    self.mark(id, JobStatus::Failed, Some(&e.to_string())).await?;
                }
            }
        }
    }

    /// Removes a finished job.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn complete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a failed attempt, rescheduling with exponential backoff until
    /// the job runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn fail(&self, claimed: &ClaimedJob, error: &str) -> Result<FailOutcome> {
        if claimed.attempts >= claimed.max_attempts {
            self.mark(claimed.id, JobStatus::Failed, Some(error)).await?;
            return Ok(FailOutcome::Dead);
        }

        let delay = chrono::Duration::from_std(self.config.backoff(claimed.attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let run_after = Utc::now() + delay;

        sqlx::query(
            "UPDATE jobs SET status = 'pending', run_after = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(db::timestamp(run_after))
        .bind(error)
        .bind(db::now())
        .bind(claimed.id.0)
        .execute(&self.pool)
        .await?;

        Ok(FailOutcome::Retry { run_after })
    }

    async fn mark(&self, id: JobId, status: JobStatus, error: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(db::now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Puts jobs left `running` by a previous process back in the queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recover(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', updated_at = ? WHERE status = 'running'",
        )
        .bind(db::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Jobs in a given state, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, status: JobStatus) -> Result<Vec<Job>> {
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM jobs WHERE status = ? ORDER BY run_after ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect())
    }

    /// Pending jobs and their earliest run time, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn scheduled(&self) -> Result<Vec<(Job, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT payload, run_after FROM jobs WHERE status = 'pending' ORDER BY run_after ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let payload: String = row.get("payload");
                let run_after: String = row.get("run_after");
                Some((
                    serde_json::from_str(&payload).ok()?,
                    db::parse_timestamp(&run_after)?,
                ))
            })
            .collect())
    }
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}
