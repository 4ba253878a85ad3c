use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CancelOutcome, EnqueueRequest, Job, JobOutcome, JobState, RetrySchedule};

/// Persistent, priority-aware job queue.
///
/// Implementations must make `claim_next` atomic (lock, compare-and-swap or
/// `SELECT FOR UPDATE SKIP LOCKED`) so that no two workers ever hold the same
/// job in flight, and must record each transition before returning it.
pub trait JobQueue: Send + Sync + Clone {
    /// Validate and store a new pending job.
    fn enqueue(
        &self,
        request: EnqueueRequest,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// The next admissible job at `now`, without claiming it.
    ///
    /// Ordered by ascending priority value, then submission time.
    fn peek_admissible(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Move a waiting job to `in_flight` for `worker_id`.
    ///
    /// Returns `false` (and changes nothing) when the job is terminal or held
    /// by another worker. Re-marking a job the same worker already holds
    /// refreshes its heartbeat.
    fn mark_in_flight(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Atomically pick the next admissible job and mark it in flight.
    fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Count one attempt against the job and refresh its heartbeat.
    ///
    /// Returns the new attempt count, or [`AppError::OwnershipLost`] when the
    /// job is not in flight for `worker_id`.
    fn record_attempt(
        &self,
        job_id: Uuid,
        worker_id: &str,
        proxy_id: Option<&str>,
    ) -> impl Future<Output = Result<u32, AppError>> + Send;

    /// Record a terminal outcome for a job `worker_id` holds.
    ///
    /// No-op on an already-terminal job. Any other job not in flight for
    /// `worker_id` is left untouched and yields [`AppError::OwnershipLost`].
    fn mark_terminal(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> impl Future<Output = Result<JobState, AppError>> + Send;

    /// Put a job `worker_id` holds back as `retry_scheduled`.
    ///
    /// A job flagged by `cancel` fails with kind `cancelled` instead; the
    /// resulting state is returned. Ownership rules match `mark_terminal`.
    fn schedule_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        schedule: RetrySchedule,
    ) -> impl Future<Output = Result<JobState, AppError>> + Send;

    fn get_status(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Remove a waiting job, or flag an in-flight one so it is not retried.
    fn cancel(&self, job_id: Uuid) -> impl Future<Output = Result<CancelOutcome, AppError>> + Send;

    fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    fn count_by_state(
        &self,
        state: JobState,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Return in-flight jobs not updated within `stale_after` to `pending`.
    fn recover_stale(
        &self,
        stale_after: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Queue depth per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_flight: u64,
    pub retry_scheduled: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl QueueDepth {
    pub async fn collect<Q: JobQueue>(queue: &Q) -> Result<Self, AppError> {
        Ok(Self {
            pending: queue.count_by_state(JobState::Pending).await?,
            in_flight: queue.count_by_state(JobState::InFlight).await?,
            retry_scheduled: queue.count_by_state(JobState::RetryScheduled).await?,
            succeeded: queue.count_by_state(JobState::Succeeded).await?,
            failed: queue.count_by_state(JobState::Failed).await?,
        })
    }

    /// Jobs not yet terminal.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight + self.retry_scheduled
    }
}

/// Enqueue a submission batch.
///
/// The whole batch is validated (size cap, URLs, priorities) before any job
/// is written, so a malformed entry rejects the batch rather than half of it.
pub async fn enqueue_batch<Q: JobQueue>(
    queue: &Q,
    requests: Vec<EnqueueRequest>,
    max_batch_size: usize,
) -> Result<Vec<Job>, AppError> {
    if requests.is_empty() {
        return Err(AppError::ConfigError("Batch is empty".into()));
    }
    if requests.len() > max_batch_size {
        return Err(AppError::ConfigError(format!(
            "Batch of {} exceeds the maximum of {max_batch_size}",
            requests.len()
        )));
    }
    for request in &requests {
        crate::job::validate_target(&request.url)?;
        if request.max_attempts == Some(0) {
            return Err(AppError::ConfigError(format!(
                "max_attempts must be at least 1 for {}",
                request.url
            )));
        }
    }

    let mut jobs = Vec::with_capacity(requests.len());
    for request in requests {
        jobs.push(queue.enqueue(request).await?);
    }
    tracing::info!(count = jobs.len(), "Batch enqueued");
    Ok(jobs)
}
