//! In-process [`JobQueue`] backed by a mutex-protected map.
//!
//! Every operation takes the lock once and applies its transition before
//! releasing it, which makes `claim_next` the atomic claim point. Nothing
//! survives a process restart; use `ferry-db` for durability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{
    CancelOutcome, EnqueueRequest, Job, JobError, JobOutcome, JobState, RetrySchedule,
};
use crate::job_queue::JobQueue;

#[derive(Debug)]
struct Entry {
    /// Insertion sequence; breaks submission-time ties so FIFO is strict.
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Entry>,
    next_seq: u64,
}

impl Inner {
    fn next_admissible(&self, now: DateTime<Utc>) -> Option<Uuid> {
        self.jobs
            .values()
            .filter(|e| e.job.is_admissible(now))
            .min_by_key(|e| (e.job.priority, e.job.submitted_at, e.seq))
            .map(|e| e.job.id)
    }

    fn get_mut(&mut self, job_id: Uuid) -> Result<&mut Job, AppError> {
        self.jobs
            .get_mut(&job_id)
            .map(|e| &mut e.job)
            .ok_or(AppError::JobNotFound(job_id))
    }
}

/// Writes for an attempt are only accepted from the worker holding the job.
fn ensure_owner(job: &Job, worker_id: &str) -> Result<(), AppError> {
    if job.state == JobState::InFlight && job.worker_id.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(AppError::OwnershipLost {
            job_id: job.id,
            worker_id: worker_id.to_string(),
        })
    }
}

/// Return an in-flight job to the waiting pool, or fail it when it was
/// cancelled while running.
fn requeue_in_flight(job: &mut Job, now: DateTime<Utc>) {
    job.worker_id = None;
    job.updated_at = now;
    if job.cancel_requested {
        job.state = JobState::Failed;
        job.last_error = Some(JobError::cancelled());
        job.captcha_token = None;
    } else {
        job.state = JobState::Pending;
    }
}

/// In-memory job queue.
#[derive(Clone)]
pub struct MemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
    default_max_attempts: u32,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_default_max_attempts(crate::retry::DEFAULT_MAX_ATTEMPTS)
    }

    /// Attempt ceiling applied to requests that do not carry their own.
    pub fn with_default_max_attempts(max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            default_max_attempts: max_attempts,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job queue mutex");
            poisoned.into_inner()
        })
    }
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Job, AppError> {
        let job = Job::from_request(&request, self.default_max_attempts)?;
        let mut inner = self.lock_inner();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        tracing::debug!(job_id = %job.id, url = %job.url, priority = %job.priority, "Job enqueued");
        Ok(job)
    }

    async fn peek_admissible(&self, now: DateTime<Utc>) -> Result<Option<Job>, AppError> {
        let inner = self.lock_inner();
        Ok(inner
            .next_admissible(now)
            .and_then(|id| inner.jobs.get(&id))
            .map(|e| e.job.clone()))
    }

    async fn mark_in_flight(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let mut inner = self.lock_inner();
        let job = inner.get_mut(job_id)?;
        let now = Utc::now();
        match job.state {
            JobState::Succeeded | JobState::Failed => Ok(false),
            JobState::InFlight => {
                if job.worker_id.as_deref() == Some(worker_id) {
                    job.updated_at = now;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            JobState::Pending | JobState::RetryScheduled => {
                job.state = JobState::InFlight;
                job.worker_id = Some(worker_id.to_string());
                job.not_before = None;
                job.updated_at = now;
                Ok(true)
            }
        }
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, AppError> {
        let mut inner = self.lock_inner();
        let Some(id) = inner.next_admissible(now) else {
            return Ok(None);
        };
        let job = inner.get_mut(id)?;
        job.state = JobState::InFlight;
        job.worker_id = Some(worker_id.to_string());
        job.not_before = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn record_attempt(
        &self,
        job_id: Uuid,
        worker_id: &str,
        proxy_id: Option<&str>,
    ) -> Result<u32, AppError> {
        let mut inner = self.lock_inner();
        let job = inner.get_mut(job_id)?;
        ensure_owner(job, worker_id)?;
        job.attempt_count += 1;
        job.last_proxy = proxy_id.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(job.attempt_count)
    }

    async fn mark_terminal(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<JobState, AppError> {
        let mut inner = self.lock_inner();
        let job = inner.get_mut(job_id)?;
        if job.state.is_terminal() {
            return Ok(job.state);
        }
        ensure_owner(job, worker_id)?;
        job.state = outcome.state();
        match outcome {
            JobOutcome::Succeeded(result) => job.result = Some(result),
            JobOutcome::Failed(error) => job.last_error = Some(error),
        }
        job.worker_id = None;
        job.not_before = None;
        job.captcha_token = None;
        job.updated_at = Utc::now();
        Ok(job.state)
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        schedule: RetrySchedule,
    ) -> Result<JobState, AppError> {
        let mut inner = self.lock_inner();
        let job = inner.get_mut(job_id)?;
        if job.state.is_terminal() {
            return Ok(job.state);
        }
        ensure_owner(job, worker_id)?;
        if let Some(error) = schedule.error {
            job.last_error = Some(error);
        }
        job.worker_id = None;
        job.updated_at = Utc::now();
        if job.cancel_requested {
            job.state = JobState::Failed;
            job.last_error = Some(JobError::cancelled());
            job.captcha_token = None;
            job.not_before = None;
        } else {
            job.state = JobState::RetryScheduled;
            job.not_before = Some(schedule.not_before);
            job.captcha_token = schedule.captcha_token;
            job.captcha_attempts = schedule.captcha_attempts;
        }
        Ok(job.state)
    }

    async fn get_status(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let inner = self.lock_inner();
        Ok(inner.jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, AppError> {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.jobs.get_mut(&job_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        match entry.job.state {
            JobState::Pending | JobState::RetryScheduled => {
                inner.jobs.remove(&job_id);
                Ok(CancelOutcome::Removed)
            }
            JobState::InFlight => {
                entry.job.cancel_requested = true;
                entry.job.updated_at = Utc::now();
                Ok(CancelOutcome::Flagged)
            }
            JobState::Succeeded | JobState::Failed => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, AppError> {
        let inner = self.lock_inner();
        let mut entries: Vec<_> = inner
            .jobs
            .values()
            .filter(|e| state.is_none_or(|s| e.job.state == s))
            .collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let inner = self.lock_inner();
        Ok(inner.jobs.values().filter(|e| e.job.state == state).count() as u64)
    }

    async fn recover_stale(&self, stale_after: Duration) -> Result<u64, AppError> {
        let threshold = TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        let mut inner = self.lock_inner();
        let mut count = 0u64;
        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.state == JobState::InFlight && now - job.updated_at > threshold {
                requeue_in_flight(job, now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut inner = self.lock_inner();
        let mut count = 0u64;
        for entry in inner.jobs.values_mut() {
            let job = &mut entry.job;
            if job.state == JobState::InFlight && job.worker_id.as_deref() == Some(worker_id) {
                requeue_in_flight(job, now);
                count += 1;
            }
        }
        Ok(count)
    }
}
