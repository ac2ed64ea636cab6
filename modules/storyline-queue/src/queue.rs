//! Durable work queue backed by a single Postgres table.
//!
//! Every state transition is one statement (or one row-locked transaction), so
//! any number of worker processes can share the table. Claims skip rows locked
//! by other claimants; a claim that outlives its timeout is re-offered; a late
//! `finish` from a superseded claimant is detected by its claim token and ignored.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Executor, PgPool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::types::{Job, JobOutcome, JobStatus, NewJob, QueueDepth, RetryPolicy};

const JOB_COLUMNS: &str = "id, job_type, payload, payload_hash, status, run_at, attempts, max_attempts, \
     timeout_secs, claim_token, created_at, started_at, completed_at, last_error";

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a job. Returns `None` when an equivalent job (same type and
    /// payload hash) is already pending or processing.
    pub async fn enqueue(&self, job: &NewJob) -> Result<Option<i64>> {
        enqueue_with(&self.pool, job).await
    }

    /// Claim the next eligible job, optionally restricted to `job_types`.
    pub async fn claim_next(&self, job_types: Option<&[&str]>) -> Result<Option<Job>> {
        self.claim(job_types, None).await
    }

    /// Claim as of `now` instead of the database clock.
    pub async fn claim_next_at(&self, job_types: Option<&[&str]>, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.claim(job_types, Some(now)).await
    }

    /// Eligible rows are pending jobs whose `run_at` has passed and processing
    /// jobs whose claim has outlived `timeout_secs` with attempts left.
    /// Ordered by `run_at`, then creation order.
    async fn claim(&self, job_types: Option<&[&str]>, now: Option<DateTime<Utc>>) -> Result<Option<Job>> {
        let types: Option<Vec<String>> = job_types.map(|t| t.iter().map(|s| s.to_string()).collect());
        let token = Uuid::new_v4();

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE job_queue
            SET status = 'processing',
                started_at = COALESCE($2, now()),
                attempts = attempts + 1,
                claim_token = $3
            WHERE id = (
                SELECT id FROM job_queue
                WHERE ($1::text[] IS NULL OR job_type = ANY($1))
                  AND (
                        (status = 'pending' AND run_at <= COALESCE($2, now()))
                     OR (status = 'processing'
                         AND started_at + make_interval(secs => timeout_secs) < COALESCE($2, now())
                         AND attempts < max_attempts)
                  )
                ORDER BY run_at, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(types)
        .bind(now)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            if job.attempts > 1 {
                debug!(job_id = job.id, job_type = %job.job_type, attempts = job.attempts, "Claimed job again");
            }
        }
        Ok(job)
    }

    /// Record the outcome of a claimed job. Returns `None` when the claim is
    /// no longer current (the job was reclaimed or already finished).
    pub async fn finish(&self, job_id: i64, claim_token: Uuid, outcome: JobOutcome) -> Result<Option<Job>> {
        self.finish_at(job_id, claim_token, outcome, Utc::now()).await
    }

    pub async fn finish_at(
        &self,
        job_id: i64,
        claim_token: Uuid,
        outcome: JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, (i32, i32)>(
            r#"
            SELECT attempts, max_attempts FROM job_queue
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(claim_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = current else {
            debug!(job_id, "Finish ignored: claim superseded");
            return Ok(None);
        };

        let (status, run_at, completed_at, error) = match outcome {
            JobOutcome::Success => (JobStatus::Done, None, Some(now), None),
            JobOutcome::Retry(error) if attempts < max_attempts => {
                let delay = chrono::Duration::from_std(self.retry.delay_for(attempts)).unwrap_or(chrono::Duration::zero());
                (JobStatus::Pending, Some(now + delay), None, Some(error))
            }
            JobOutcome::Retry(error) | JobOutcome::Fatal(error) => (JobStatus::Failed, None, Some(now), Some(error)),
        };

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE job_queue
            SET status = $2,
                run_at = COALESCE($3, run_at),
                completed_at = $4,
                last_error = $5,
                claim_token = NULL
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(status.as_str())
        .bind(run_at)
        .bind(completed_at)
        .bind(&error)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        match job.status {
            JobStatus::Failed => warn!(
                job_id,
                job_type = %job.job_type,
                attempts = job.attempts,
                error = job.last_error.as_deref().unwrap_or(""),
                "Job failed permanently"
            ),
            JobStatus::Pending => info!(
                job_id,
                job_type = %job.job_type,
                attempts = job.attempts,
                run_at = %job.run_at,
                "Job scheduled for retry"
            ),
            _ => {}
        }
        Ok(Some(job))
    }

    /// Mark a pending job failed so no worker will claim it.
    /// In-flight jobs are not preemptible and are left alone.
    pub async fn cancel(&self, job_id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE job_queue
            SET status = 'failed', completed_at = now(), last_error = 'cancelled'
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        if job.is_some() {
            info!(job_id, "Job cancelled");
        }
        Ok(job)
    }

    /// Operator retry of a failed job: back to pending with a fresh attempt
    /// budget. Returns `None` if the job is not failed or an equivalent job is
    /// already live.
    pub async fn requeue(&self, job_id: i64) -> Result<Option<Job>> {
        let result = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE job_queue
            SET status = 'pending', attempts = 0, run_at = now(),
                started_at = NULL, completed_at = NULL, claim_token = NULL
            WHERE id = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(job) => {
                if job.is_some() {
                    info!(job_id, "Failed job requeued");
                }
                Ok(job)
            }
            Err(e) if is_unique_violation(&e) => {
                info!(job_id, "Requeue skipped: equivalent job already live");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fail processing jobs whose claim timed out with no attempts left, so
    /// they do not sit in `processing` forever. Returns the ids affected.
    pub async fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE job_queue
            SET status = 'failed',
                completed_at = $1,
                claim_token = NULL,
                last_error = format('abandoned: no completion within %s seconds after %s attempts',
                                    timeout_secs, attempts)
            WHERE status = 'processing'
              AND started_at + make_interval(secs => timeout_secs) < $1
              AND attempts >= max_attempts
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            warn!(count = ids.len(), ?ids, "Abandoned jobs marked failed");
        }
        Ok(ids)
    }

    pub async fn get(&self, job_id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Most recently failed jobs, with their last error, for diagnosis.
    pub async fn list_failed(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM job_queue
            WHERE status = 'failed'
            ORDER BY completed_at DESC NULLS LAST, id DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    pub async fn depth(&self) -> Result<QueueDepth> {
        let rows = sqlx::query_as::<_, (String, i64)>("SELECT status, COUNT(*) FROM job_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut depth = QueueDepth::default();
        for (status, count) in rows {
            match JobStatus::parse(&status)? {
                JobStatus::Pending => depth.pending = count,
                JobStatus::Processing => depth.processing = count,
                JobStatus::Done => depth.done = count,
                JobStatus::Failed => depth.failed = count,
            }
        }
        Ok(depth)
    }
}

// ---------------------------------------------------------------------------
// Enqueue on any executor
// ---------------------------------------------------------------------------

/// Insert a job through any executor, so callers can enqueue inside their own
/// transaction and have the job commit or roll back with their writes.
pub async fn enqueue_with<'e, E>(executor: E, job: &NewJob) -> Result<Option<i64>>
where
    E: Executor<'e, Database = Postgres>,
{
    let hash = job.payload_hash();
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO job_queue (job_type, payload, payload_hash, run_at, max_attempts, timeout_secs)
        VALUES ($1, $2, $3, COALESCE($4, now()), $5, $6)
        ON CONFLICT (job_type, payload_hash) WHERE status IN ('pending', 'processing')
        DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(&hash)
    .bind(job.run_at)
    .bind(job.max_attempts)
    .bind(job.timeout_secs)
    .fetch_optional(executor)
    .await?;

    match id {
        Some(id) => debug!(job_id = id, job_type = %job.job_type, "Job enqueued"),
        None => debug!(job_type = %job.job_type, payload_hash = %hash, "Enqueue skipped: equivalent job live"),
    }
    Ok(id)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for Job
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, PgRow> for Job {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = JobStatus::parse(&status).map_err(|e: QueueError| sqlx::Error::ColumnDecode {
            index: "status".into(),
            source: Box::new(e),
        })?;
        Ok(Job {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            payload_hash: row.try_get("payload_hash")?,
            status,
            run_at: row.try_get("run_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            timeout_secs: row.try_get("timeout_secs")?,
            claim_token: row.try_get("claim_token")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}
