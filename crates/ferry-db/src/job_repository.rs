use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use ferry_core::error::{AppError, FailureKind};
use ferry_core::job::{
    CancelOutcome, EnqueueRequest, Job, JobError, JobOutcome, JobResult, JobState, Priority,
    RetrySchedule,
};
use ferry_core::job_queue::JobQueue;
use ferry_core::retry::DEFAULT_MAX_ATTEMPTS;

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct FetchJobRepository {
    pool: Pool<Postgres>,
    default_max_attempts: u32,
}

impl FetchJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Attempt ceiling applied to requests that do not carry their own.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Error for an attempt write that matched no row held by `worker_id`.
    async fn lost_ownership(&self, job_id: Uuid, worker_id: &str) -> AppError {
        match self.get_status(job_id).await {
            Ok(Some(_)) => AppError::OwnershipLost {
                job_id,
                worker_id: worker_id.to_string(),
            },
            Ok(None) => AppError::JobNotFound(job_id),
            Err(e) => e,
        }
    }

    /// Outcome of a transition write that matched no row: terminal jobs
    /// report their state, anything else was taken from `worker_id`.
    async fn unowned_transition(&self, job_id: Uuid, worker_id: &str) -> Result<JobState, AppError> {
        let state = self.existing_state(job_id).await?;
        if state.is_terminal() {
            Ok(state)
        } else {
            Err(AppError::OwnershipLost {
                job_id,
                worker_id: worker_id.to_string(),
            })
        }
    }

    /// Current state of a job the caller failed to update.
    async fn existing_state(&self, job_id: Uuid) -> Result<JobState, AppError> {
        self.get_status(job_id)
            .await?
            .map(|job| job.state)
            .ok_or(AppError::JobNotFound(job_id))
    }
}

fn db_error(e: sqlx::Error) -> AppError {
    AppError::PersistenceError(e.to_string())
}

fn parse_state(raw: &str) -> Result<JobState, AppError> {
    raw.parse().map_err(AppError::PersistenceError)
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct FetchJobRow {
    id: Uuid,
    url: String,
    domain: String,
    priority: i16,
    state: String,
    attempt_count: i32,
    max_attempts: i32,
    captcha_attempts: i32,
    not_before: Option<DateTime<Utc>>,
    last_error_kind: Option<String>,
    last_error_message: Option<String>,
    last_proxy: Option<String>,
    captcha_token: Option<String>,
    cancel_requested: bool,
    result_status: Option<i32>,
    result_body: Option<String>,
    result_hash: Option<String>,
    fetched_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    submitted_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FetchJobRow> for Job {
    fn from(row: FetchJobRow) -> Self {
        let last_error = row.last_error_kind.map(|kind| {
            JobError::new(
                kind.parse().unwrap_or(FailureKind::Persistence),
                row.last_error_message.unwrap_or_default(),
            )
        });
        let result = row.result_status.map(|status| JobResult {
            status: status as u16,
            body: row.result_body.unwrap_or_default(),
            content_hash: row.result_hash.unwrap_or_default(),
            fetched_at: row.fetched_at.unwrap_or(row.updated_at),
        });

        Job {
            id: row.id,
            url: row.url,
            domain: row.domain,
            priority: Priority::new(row.priority as u8).unwrap_or_default(),
            state: row.state.parse().unwrap_or(JobState::Pending),
            attempt_count: row.attempt_count as u32,
            max_attempts: row.max_attempts as u32,
            captcha_attempts: row.captcha_attempts as u32,
            not_before: row.not_before,
            last_error,
            last_proxy: row.last_proxy,
            captcha_token: row.captcha_token,
            cancel_requested: row.cancel_requested,
            result,
            worker_id: row.worker_id,
            submitted_at: row.submitted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl JobQueue for FetchJobRepository {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, AppError> {
        let job = Job::from_request(&request, self.default_max_attempts)?;
        let row = sqlx::query_as::<_, FetchJobRow>(
            r#"
            INSERT INTO fetch_jobs (id, url, domain, priority, max_attempts, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.url)
        .bind(&job.domain)
        .bind(job.priority.value() as i16)
        .bind(job.max_attempts as i32)
        .bind(job.submitted_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::debug!(job_id = %row.id, url = %row.url, priority = row.priority, "Job enqueued");
        Ok(row.into())
    }

    async fn peek_admissible(&self, now: DateTime<Utc>) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, FetchJobRow>(
            r#"
            SELECT * FROM fetch_jobs
            WHERE state IN ('pending', 'retry_scheduled')
              AND (not_before IS NULL OR not_before <= $1)
            ORDER BY priority, submitted_at, seq
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn mark_in_flight(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE fetch_jobs
            SET state = 'in_flight', worker_id = $2, not_before = NULL, updated_at = NOW()
            WHERE id = $1
              AND (state IN ('pending', 'retry_scheduled')
                   OR (state = 'in_flight' AND worker_id = $2))
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.existing_state(job_id).await.map(|_| false)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, FetchJobRow>(
            r#"
            UPDATE fetch_jobs
            SET state = 'in_flight', worker_id = $1, not_before = NULL, updated_at = NOW()
            WHERE id = (
                SELECT id FROM fetch_jobs
                WHERE state IN ('pending', 'retry_scheduled')
                  AND (not_before IS NULL OR not_before <= $2)
                ORDER BY priority, submitted_at, seq
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn record_attempt(
        &self,
        job_id: Uuid,
        worker_id: &str,
        proxy_id: Option<&str>,
    ) -> Result<u32, AppError> {
        let count: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE fetch_jobs
            SET attempt_count = attempt_count + 1,
                last_proxy = $2,
                updated_at = NOW()
            WHERE id = $1 AND state = 'in_flight' AND worker_id = $3
            RETURNING attempt_count
            "#,
        )
        .bind(job_id)
        .bind(proxy_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match count {
            Some((count,)) => Ok(count as u32),
            None => Err(self.lost_ownership(job_id, worker_id).await),
        }
    }

    async fn mark_terminal(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<JobState, AppError> {
        let target = outcome.state();
        let (result, error) = match &outcome {
            JobOutcome::Succeeded(result) => (Some(result), None),
            JobOutcome::Failed(error) => (None, Some(error)),
        };

        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE fetch_jobs
            SET state = $2,
                result_status = $3::int,
                result_body = $4::text,
                result_hash = $5::varchar,
                fetched_at = $6::timestamptz,
                last_error_kind = COALESCE($7::varchar, last_error_kind),
                last_error_message = COALESCE($8::text, last_error_message),
                worker_id = NULL,
                not_before = NULL,
                captcha_token = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'in_flight' AND worker_id = $9
            RETURNING state
            "#,
        )
        .bind(job_id)
        .bind(target.as_str())
        .bind(result.map(|r| r.status as i32))
        .bind(result.map(|r| r.body.as_str()))
        .bind(result.map(|r| r.content_hash.as_str()))
        .bind(result.map(|r| r.fetched_at))
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match updated {
            Some((state,)) => parse_state(&state),
            None => self.unowned_transition(job_id, worker_id).await,
        }
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        schedule: RetrySchedule,
    ) -> Result<JobState, AppError> {
        let cancelled = JobError::cancelled();
        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE fetch_jobs
            SET state = CASE WHEN cancel_requested THEN 'failed' ELSE 'retry_scheduled' END,
                not_before = CASE WHEN cancel_requested THEN NULL ELSE $2::timestamptz END,
                captcha_token = CASE WHEN cancel_requested THEN NULL ELSE $3::text END,
                captcha_attempts = CASE WHEN cancel_requested THEN captcha_attempts ELSE $4::int END,
                last_error_kind = CASE WHEN cancel_requested THEN $7::varchar
                                       ELSE COALESCE($5::varchar, last_error_kind) END,
                last_error_message = CASE WHEN cancel_requested THEN $8::text
                                          ELSE COALESCE($6::text, last_error_message) END,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'in_flight' AND worker_id = $9
            RETURNING state
            "#,
        )
        .bind(job_id)
        .bind(schedule.not_before)
        .bind(schedule.captcha_token.as_deref())
        .bind(schedule.captcha_attempts as i32)
        .bind(schedule.error.as_ref().map(|e| e.kind.as_str()))
        .bind(schedule.error.as_ref().map(|e| e.message.as_str()))
        .bind(cancelled.kind.as_str())
        .bind(cancelled.message.as_str())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match updated {
            Some((state,)) => parse_state(&state),
            None => self.unowned_transition(job_id, worker_id).await,
        }
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, FetchJobRow>(r#"SELECT * FROM fetch_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let current: Option<(String,)> =
            sqlx::query_as(r#"SELECT state FROM fetch_jobs WHERE id = $1 FOR UPDATE"#)
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;
        let Some((state,)) = current else {
            return Ok(CancelOutcome::NotFound);
        };

        let outcome = match parse_state(&state)? {
            JobState::Pending | JobState::RetryScheduled => {
                sqlx::query(r#"DELETE FROM fetch_jobs WHERE id = $1"#)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
                CancelOutcome::Removed
            }
            JobState::InFlight => {
                sqlx::query(
                    r#"UPDATE fetch_jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1"#,
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
                CancelOutcome::Flagged
            }
            JobState::Succeeded | JobState::Failed => CancelOutcome::AlreadyTerminal,
        };

        tx.commit().await.map_err(db_error)?;
        Ok(outcome)
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows = if let Some(state) = state {
            sqlx::query_as::<_, FetchJobRow>(
                r#"
                SELECT * FROM fetch_jobs
                WHERE state = $1
                ORDER BY seq DESC
                LIMIT $2
                "#,
            )
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, FetchJobRow>(
                r#"
                SELECT * FROM fetch_jobs
                ORDER BY seq DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM fetch_jobs WHERE state = $1"#)
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?;

        Ok(count as u64)
    }

    async fn recover_stale(&self, stale_after: Duration) -> Result<u64, AppError> {
        let cancelled = JobError::cancelled();
        let result = sqlx::query(
            r#"
            UPDATE fetch_jobs
            SET state = CASE WHEN cancel_requested THEN 'failed' ELSE 'pending' END,
                last_error_kind = CASE WHEN cancel_requested THEN $2::varchar ELSE last_error_kind END,
                last_error_message = CASE WHEN cancel_requested THEN $3::text ELSE last_error_message END,
                captcha_token = CASE WHEN cancel_requested THEN NULL ELSE captcha_token END,
                worker_id = NULL,
                updated_at = NOW()
            WHERE state = 'in_flight'
              AND updated_at < NOW() - make_interval(secs => $1::float8)
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .bind(cancelled.kind.as_str())
        .bind(cancelled.message.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let cancelled = JobError::cancelled();
        let result = sqlx::query(
            r#"
            UPDATE fetch_jobs
            SET state = CASE WHEN cancel_requested THEN 'failed' ELSE 'pending' END,
                last_error_kind = CASE WHEN cancel_requested THEN $2::varchar ELSE last_error_kind END,
                last_error_message = CASE WHEN cancel_requested THEN $3::text ELSE last_error_message END,
                captcha_token = CASE WHEN cancel_requested THEN NULL ELSE captcha_token END,
                worker_id = NULL,
                updated_at = NOW()
            WHERE worker_id = $1 AND state = 'in_flight'
            "#,
        )
        .bind(worker_id)
        .bind(cancelled.kind.as_str())
        .bind(cancelled.message.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}
