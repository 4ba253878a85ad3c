//! Worker pool that drives jobs from the queue to a terminal state.
//!
//! Each worker repeatedly claims the next admissible job and runs one
//! attempt. [`Dispatcher::step`] makes every decision for that attempt and
//! returns a [`Transition`]; [`Dispatcher::commit`] writes it to the queue.
//! Every write is fenced on the claiming worker, so a worker whose job was
//! recovered and reclaimed elsewhere drops its result.
//!
//! ```text
//! claim_next ─> domain permit? ─no─> Defer (capacity_delay, no attempt used)
//!                    │yes
//!               proxy lease? ──no──> Defer
//!                    │yes
//!            record_attempt, execute under attempt_timeout
//!                    │
//!        classify ─┬─ success ──────────────> Succeed
//!                  ├─ retryable ────────────> Retry (backoff)
//!                  ├─ captcha ─> solver ──┬─> Retry (token, no backoff)
//!                  │                      └─> Retry (backoff) or Fail
//!                  └─ fatal / ceiling ─────> Fail
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::captcha::{CaptchaGate, CaptchaResolution, Challenge};
use crate::error::{AppError, FailureKind};
use crate::job::{Job, JobError, JobOutcome, JobResult, JobState, RetrySchedule};
use crate::job_queue::{JobQueue, QueueDepth};
use crate::limiter::DomainRateLimiter;
use crate::proxy::{ProxyLease, ProxyPool, ProxyPoolStats};
use crate::retry::{Attempt, OutcomeClass, RetryPolicy};
use crate::traits::{AttemptOutcome, CaptchaSolver, FetchExecutor, TransportErrorKind};

/// Tries per queue write before a transition is given up on.
const COMMIT_ATTEMPTS: u32 = 3;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub worker_id_prefix: String,
    /// First idle sleep when the queue has nothing admissible.
    pub poll_interval: Duration,
    /// Idle sleeps double up to this bound.
    pub max_poll_interval: Duration,
    /// How far a job is pushed back when its domain or the proxy pool is full.
    pub capacity_delay: Duration,
    /// Hard bound on one execution, enforced around the executor.
    pub attempt_timeout: Duration,
    /// In-flight jobs untouched for this long are returned to pending.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            worker_id_prefix: "ferry-worker".to_string(),
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
            capacity_delay: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration, max: Duration) -> Self {
        self.poll_interval = poll;
        self.max_poll_interval = max;
        self
    }

    pub fn with_capacity_delay(mut self, delay: Duration) -> Self {
        self.capacity_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// `solve_timeout` is the CAPTCHA gate's bound; a job can legitimately
    /// stay in flight for an attempt plus a solve.
    pub fn validate(&self, solve_timeout: Duration) -> Result<(), AppError> {
        if self.workers == 0 {
            return Err(AppError::ConfigError("workers must be at least 1".into()));
        }
        if self.poll_interval.is_zero() || self.poll_interval > self.max_poll_interval {
            return Err(AppError::ConfigError(
                "poll_interval must be non-zero and at most max_poll_interval".into(),
            ));
        }
        if self.attempt_timeout.is_zero() || self.sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "attempt_timeout and sweep_interval must be non-zero".into(),
            ));
        }
        if self.stale_after <= self.attempt_timeout + solve_timeout {
            return Err(AppError::ConfigError(format!(
                "stale_after ({:?}) must exceed attempt_timeout + solve_timeout ({:?})",
                self.stale_after,
                self.attempt_timeout + solve_timeout
            )));
        }
        Ok(())
    }
}

/// Why a job was pushed back without spending an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    DomainBusy,
    NoProxy,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::DomainBusy => write!(f, "domain at capacity"),
            DeferReason::NoProxy => write!(f, "no usable proxy"),
        }
    }
}

/// Decision for one claimed job.
#[derive(Debug, Clone)]
pub enum Transition {
    Succeed(JobResult),
    Fail(JobError),
    Retry(RetrySchedule),
    Defer {
        schedule: RetrySchedule,
        reason: DeferReason,
    },
    /// The attempt could not be recorded. The job is left in flight for the
    /// recovery sweep.
    Abandon(String),
}

/// Events emitted by the dispatcher for monitoring/logging.
#[derive(Debug, Clone)]
pub enum DispatchEvent<'a> {
    WorkerStarted {
        worker_id: &'a str,
    },
    JobClaimed {
        job: &'a Job,
    },
    AttemptFinished {
        job_id: Uuid,
        attempt_count: u32,
        attempt: &'a Attempt,
        class: OutcomeClass,
    },
    CaptchaDetected {
        job_id: Uuid,
        challenge: &'a Challenge,
    },
    CaptchaSolved {
        job_id: Uuid,
    },
    CaptchaUnresolved {
        job_id: Uuid,
        reason: &'a str,
    },
    Deferred {
        job_id: Uuid,
        reason: DeferReason,
    },
    RetryScheduled {
        job_id: Uuid,
        not_before: DateTime<Utc>,
    },
    JobSucceeded {
        job_id: Uuid,
        status: u16,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a JobError,
    },
    Abandoned {
        job_id: Uuid,
        reason: &'a str,
    },
    CommitFailed {
        job_id: Uuid,
        error: &'a AppError,
    },
    OwnershipLost {
        job_id: Uuid,
        worker_id: &'a str,
    },
    StaleRecovered {
        count: u64,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    WorkerStopped {
        worker_id: &'a str,
    },
}

impl DispatchEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::WorkerStarted { .. } => "worker_started",
            DispatchEvent::JobClaimed { .. } => "job_claimed",
            DispatchEvent::AttemptFinished { .. } => "attempt_finished",
            DispatchEvent::CaptchaDetected { .. } => "captcha_detected",
            DispatchEvent::CaptchaSolved { .. } => "captcha_solved",
            DispatchEvent::CaptchaUnresolved { .. } => "captcha_unresolved",
            DispatchEvent::Deferred { .. } => "deferred",
            DispatchEvent::RetryScheduled { .. } => "retry_scheduled",
            DispatchEvent::JobSucceeded { .. } => "job_succeeded",
            DispatchEvent::JobFailed { .. } => "job_failed",
            DispatchEvent::Abandoned { .. } => "abandoned",
            DispatchEvent::CommitFailed { .. } => "commit_failed",
            DispatchEvent::OwnershipLost { .. } => "ownership_lost",
            DispatchEvent::StaleRecovered { .. } => "stale_recovered",
            DispatchEvent::ShuttingDown { .. } => "shutting_down",
            DispatchEvent::WorkerStopped { .. } => "worker_stopped",
        }
    }
}

/// Trait for receiving dispatcher events (decoupled logging).
pub trait DispatchReporter: Send + Sync {
    fn report(&self, event: DispatchEvent<'_>) {
        let _ = event;
    }
}

impl<T: DispatchReporter + ?Sized> DispatchReporter for Arc<T> {
    fn report(&self, event: DispatchEvent<'_>) {
        (**self).report(event);
    }
}

/// Fan out to two reporters.
impl<A: DispatchReporter, B: DispatchReporter> DispatchReporter for (A, B) {
    fn report(&self, event: DispatchEvent<'_>) {
        self.0.report(event.clone());
        self.1.report(event);
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl DispatchReporter for TracingReporter {
    fn report(&self, event: DispatchEvent<'_>) {
        match event {
            DispatchEvent::WorkerStarted { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            DispatchEvent::JobClaimed { job } => {
                tracing::debug!(
                    job_id = %job.id,
                    url = %job.url,
                    priority = %job.priority,
                    attempt_count = job.attempt_count,
                    "Job claimed"
                );
            }
            DispatchEvent::AttemptFinished {
                job_id,
                attempt_count,
                attempt,
                class,
            } => {
                let elapsed_ms = attempt.outcome.elapsed().as_millis() as u64;
                tracing::info!(
                    %job_id,
                    attempt_count,
                    status = ?attempt.status(),
                    proxy = ?attempt.proxy_id,
                    elapsed_ms,
                    %class,
                    "Attempt finished"
                );
            }
            DispatchEvent::CaptchaDetected { job_id, challenge } => {
                tracing::warn!(%job_id, kind = ?challenge.kind, url = %challenge.url, "CAPTCHA detected");
            }
            DispatchEvent::CaptchaSolved { job_id } => {
                tracing::info!(%job_id, "CAPTCHA solved");
            }
            DispatchEvent::CaptchaUnresolved { job_id, reason } => {
                tracing::warn!(%job_id, %reason, "CAPTCHA unresolved");
            }
            DispatchEvent::Deferred { job_id, reason } => {
                tracing::debug!(%job_id, %reason, "Job deferred");
            }
            DispatchEvent::RetryScheduled { job_id, not_before } => {
                tracing::info!(%job_id, %not_before, "Retry scheduled");
            }
            DispatchEvent::JobSucceeded { job_id, status } => {
                tracing::info!(%job_id, status, "Job succeeded");
            }
            DispatchEvent::JobFailed { job_id, error } => {
                tracing::warn!(%job_id, kind = %error.kind, error = %error.message, "Job failed");
            }
            DispatchEvent::Abandoned { job_id, reason } => {
                tracing::error!(%job_id, %reason, "Attempt abandoned without a transition");
            }
            DispatchEvent::CommitFailed { job_id, error } => {
                tracing::error!(%job_id, error = %error, "Failed to record job transition");
            }
            DispatchEvent::OwnershipLost { job_id, worker_id } => {
                tracing::warn!(%job_id, %worker_id, "Job reclaimed elsewhere, result dropped");
            }
            DispatchEvent::StaleRecovered { count } => {
                tracing::warn!(count, "Recovered stale in-flight jobs");
            }
            DispatchEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            DispatchEvent::WorkerStopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Reporter that keeps counters for the health snapshot.
#[derive(Debug, Default)]
pub struct MetricsReporter {
    attempts: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    deferrals: AtomicU64,
    captcha_challenges: AtomicU64,
    captcha_solved: AtomicU64,
    stale_recovered: AtomicU64,
    commit_failures: AtomicU64,
    ownership_lost: AtomicU64,
    failures_by_kind: [AtomicU64; FailureKind::ALL.len()],
}

/// Counter values at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub deferrals: u64,
    pub captcha_challenges: u64,
    pub captcha_solved: u64,
    pub stale_recovered: u64,
    pub commit_failures: u64,
    pub ownership_lost: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
}

impl MetricsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            attempts: load(&self.attempts),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            retries: load(&self.retries),
            deferrals: load(&self.deferrals),
            captcha_challenges: load(&self.captcha_challenges),
            captcha_solved: load(&self.captcha_solved),
            stale_recovered: load(&self.stale_recovered),
            commit_failures: load(&self.commit_failures),
            ownership_lost: load(&self.ownership_lost),
            failures_by_kind: FailureKind::ALL
                .iter()
                .zip(&self.failures_by_kind)
                .map(|(kind, c)| (kind.as_str().to_string(), load(c)))
                .filter(|(_, n)| *n > 0)
                .collect(),
        }
    }
}

impl DispatchReporter for MetricsReporter {
    fn report(&self, event: DispatchEvent<'_>) {
        let bump = |c: &AtomicU64, n: u64| {
            c.fetch_add(n, Ordering::Relaxed);
        };
        match event {
            DispatchEvent::AttemptFinished { .. } => bump(&self.attempts, 1),
            DispatchEvent::CaptchaDetected { .. } => bump(&self.captcha_challenges, 1),
            DispatchEvent::CaptchaSolved { .. } => bump(&self.captcha_solved, 1),
            DispatchEvent::Deferred { .. } => bump(&self.deferrals, 1),
            DispatchEvent::RetryScheduled { .. } => bump(&self.retries, 1),
            DispatchEvent::JobSucceeded { .. } => bump(&self.succeeded, 1),
            DispatchEvent::JobFailed { error, .. } => {
                bump(&self.failed, 1);
                if let Some(idx) = FailureKind::ALL.iter().position(|k| *k == error.kind) {
                    bump(&self.failures_by_kind[idx], 1);
                }
            }
            DispatchEvent::CommitFailed { .. } => bump(&self.commit_failures, 1),
            DispatchEvent::OwnershipLost { .. } => bump(&self.ownership_lost, 1),
            DispatchEvent::StaleRecovered { count } => bump(&self.stale_recovered, count),
            _ => {}
        }
    }
}

/// Queue depth, proxy health and counters in one place.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub queue: QueueDepth,
    pub proxies: ProxyPoolStats,
    pub metrics: Option<MetricsSnapshot>,
}

/// The worker a claimed job belongs to. An unclaimed snapshot owns nothing,
/// so every write for it is rejected.
fn owner(job: &Job) -> &str {
    job.worker_id.as_deref().unwrap_or_default()
}

fn after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

/// Job dispatcher. Clones share the queue, pools and limiter.
#[derive(Clone)]
pub struct Dispatcher<Q, E, S> {
    queue: Q,
    executor: E,
    proxies: ProxyPool,
    limiter: DomainRateLimiter,
    captcha: CaptchaGate<S>,
    policy: RetryPolicy,
    config: DispatcherConfig,
}

impl<Q, E, S> Dispatcher<Q, E, S>
where
    Q: JobQueue + 'static,
    E: FetchExecutor + 'static,
    S: CaptchaSolver + 'static,
{
    pub fn new(
        queue: Q,
        executor: E,
        proxies: ProxyPool,
        limiter: DomainRateLimiter,
        captcha: CaptchaGate<S>,
        policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Result<Self, AppError> {
        policy.validate()?;
        config.validate(captcha.solve_timeout())?;
        Ok(Self {
            queue,
            executor,
            proxies,
            limiter,
            captcha,
            policy,
            config,
        })
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// Run the worker pool until `cancel` fires.
    ///
    /// Recovers stale jobs first, then spawns the workers and the periodic
    /// recovery sweep. Returns once every worker has drained.
    pub async fn run<R>(&self, cancel: CancellationToken, reporter: Arc<R>) -> Result<(), AppError>
    where
        R: DispatchReporter + 'static,
    {
        self.sweep(&*reporter).await?;

        let run_id = Uuid::new_v4().simple().to_string();
        let mut tasks = JoinSet::new();
        for n in 1..=self.config.workers {
            let worker = self.clone();
            let cancel = cancel.clone();
            let reporter = Arc::clone(&reporter);
            let worker_id = format!("{}-{}-{n}", self.config.worker_id_prefix, &run_id[..8]);
            tasks.spawn(async move { worker.worker_loop(worker_id, cancel, reporter).await });
        }
        {
            let sweeper = self.clone();
            let cancel = cancel.clone();
            let reporter = Arc::clone(&reporter);
            tasks.spawn(async move { sweeper.sweep_loop(cancel, reporter).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatcher task panicked");
            }
        }
        Ok(())
    }

    async fn worker_loop<R: DispatchReporter>(
        &self,
        worker_id: String,
        cancel: CancellationToken,
        reporter: Arc<R>,
    ) {
        reporter.report(DispatchEvent::WorkerStarted {
            worker_id: &worker_id,
        });

        let mut idle = self.config.poll_interval;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.queue.claim_next(&worker_id, Utc::now()).await {
                Ok(Some(job)) => {
                    idle = self.config.poll_interval;
                    reporter.report(DispatchEvent::JobClaimed { job: &job });
                    let transition = self.step(&job, &*reporter).await;
                    self.commit(&job, transition, &*reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(idle) => {}
                        () = cancel.cancelled() => break,
                    }
                    idle = (idle * 2).min(self.config.max_poll_interval);
                }
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }

        let released = match self.queue.release_worker_jobs(&worker_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(%worker_id, error = %e, "Failed to release worker jobs");
                0
            }
        };
        reporter.report(DispatchEvent::ShuttingDown {
            worker_id: &worker_id,
            jobs_released: released,
        });
        reporter.report(DispatchEvent::WorkerStopped {
            worker_id: &worker_id,
        });
    }

    async fn sweep_loop<R: DispatchReporter>(&self, cancel: CancellationToken, reporter: Arc<R>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; `run` has just swept.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(&*reporter).await {
                        tracing::error!(error = %e, "Recovery sweep failed");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    }

    /// Return in-flight jobs that stopped making progress to pending.
    pub async fn sweep<R: DispatchReporter + ?Sized>(&self, reporter: &R) -> Result<u64, AppError> {
        let count = self.queue.recover_stale(self.config.stale_after).await?;
        if count > 0 {
            reporter.report(DispatchEvent::StaleRecovered { count });
        }
        Ok(count)
    }

    /// Run one attempt for a claimed job and decide what happens next.
    ///
    /// Nothing is written here except the attempt counter; the returned
    /// transition is applied by [`Dispatcher::commit`].
    pub async fn step<R: DispatchReporter + ?Sized>(&self, job: &Job, reporter: &R) -> Transition {
        let ceiling = self.policy.ceiling_for(job.max_attempts);
        // A job recovered after its last attempt was counted but never committed.
        if job.standard_attempts() >= ceiling {
            return Transition::Fail(job.last_error.clone().unwrap_or_else(|| {
                JobError::new(
                    FailureKind::TransientNetwork,
                    "Attempt budget spent before the outcome was recorded",
                )
            }));
        }

        let Some(permit) = self.limiter.try_acquire(&job.domain) else {
            return self.defer(job, DeferReason::DomainBusy);
        };
        let Some(lease) = self.proxies.acquire() else {
            drop(permit);
            return self.defer(job, DeferReason::NoProxy);
        };

        let proxy_id = (!lease.is_direct()).then(|| lease.id.clone());
        let attempt_count = match self
            .queue
            .record_attempt(job.id, owner(job), proxy_id.as_deref())
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.proxies.release_unused(&lease);
                return Transition::Abandon(format!("Could not record attempt: {e}"));
            }
        };

        let started_at = Utc::now();
        let outcome = self
            .execute_guarded(&job.url, &lease, job.captcha_token.clone())
            .await;
        let finished_at = Utc::now();

        let challenge = match &outcome {
            AttemptOutcome::Response { status, body, .. } => {
                self.captcha.detector().detect(&job.url, *status, body)
            }
            AttemptOutcome::Transport { .. } => None,
        };
        self.proxies
            .report_lease(&lease, outcome.proxy_healthy(challenge.is_some()));
        drop(permit);

        let attempt = Attempt {
            job_id: job.id,
            proxy_id,
            started_at,
            finished_at,
            outcome,
            challenge,
        };
        // Challenges are bounded by the CAPTCHA ceiling, not this one.
        let class = self.policy.apply_ceiling(
            self.policy.classify(&attempt),
            attempt_count.saturating_sub(job.captcha_attempts),
            ceiling,
        );
        reporter.report(DispatchEvent::AttemptFinished {
            job_id: job.id,
            attempt_count,
            attempt: &attempt,
            class,
        });

        match class {
            OutcomeClass::Success => match attempt.outcome {
                AttemptOutcome::Response { status, body, .. } => {
                    Transition::Succeed(JobResult::new(status, body))
                }
                other => Transition::Fail(failure_of(&other)),
            },
            OutcomeClass::RetryableFailure => {
                let delay = self.policy.next_delay(attempt_count);
                Transition::Retry(
                    RetrySchedule::at(after(delay))
                        .with_error(failure_of(&attempt.outcome))
                        .with_captcha(None, job.captcha_attempts),
                )
            }
            OutcomeClass::FatalFailure => Transition::Fail(failure_of(&attempt.outcome)),
            OutcomeClass::CaptchaChallenge => match &attempt.challenge {
                Some(challenge) => self.on_challenge(job, challenge, reporter).await,
                None => Transition::Fail(failure_of(&attempt.outcome)),
            },
        }
    }

    async fn on_challenge<R: DispatchReporter + ?Sized>(
        &self,
        job: &Job,
        challenge: &Challenge,
        reporter: &R,
    ) -> Transition {
        reporter.report(DispatchEvent::CaptchaDetected {
            job_id: job.id,
            challenge,
        });
        let error = JobError::new(
            FailureKind::Captcha,
            format!("CAPTCHA challenge ({:?}) at {}", challenge.kind, challenge.url),
        );
        if !self.policy.captcha_budget_left(job.captcha_attempts) {
            return Transition::Fail(error);
        }

        let captcha_attempts = job.captcha_attempts + 1;
        match self.captcha.handle_challenge(job, challenge).await {
            CaptchaResolution::Resolved(token) => {
                reporter.report(DispatchEvent::CaptchaSolved { job_id: job.id });
                Transition::Retry(
                    RetrySchedule::at(Utc::now())
                        .with_error(error)
                        .with_captcha(Some(token), captcha_attempts),
                )
            }
            CaptchaResolution::Unresolved(reason) => {
                reporter.report(DispatchEvent::CaptchaUnresolved {
                    job_id: job.id,
                    reason: &reason,
                });
                if !self.policy.captcha_budget_left(captcha_attempts) {
                    return Transition::Fail(JobError::new(
                        FailureKind::Captcha,
                        format!("CAPTCHA unresolved after {captcha_attempts} challenges: {reason}"),
                    ));
                }
                let delay = self.policy.next_delay(captcha_attempts);
                Transition::Retry(
                    RetrySchedule::at(after(delay))
                        .with_error(error)
                        .with_captcha(None, captcha_attempts),
                )
            }
        }
    }

    fn defer(&self, job: &Job, reason: DeferReason) -> Transition {
        Transition::Defer {
            schedule: RetrySchedule::at(after(self.config.capacity_delay))
                .with_captcha(job.captcha_token.clone(), job.captcha_attempts),
            reason,
        }
    }

    /// Execute in a separate task under `attempt_timeout`, so a hung or
    /// panicking executor surfaces as a transport failure.
    async fn execute_guarded(
        &self,
        url: &str,
        lease: &ProxyLease,
        captcha_token: Option<String>,
    ) -> AttemptOutcome {
        let executor = self.executor.clone();
        let url = url.to_string();
        let lease = lease.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            executor
                .execute(&url, &lease, captcha_token.as_deref())
                .await
        });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.config.attempt_timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => AttemptOutcome::Transport {
                kind: TransportErrorKind::Other,
                message: format!("Executor task failed: {e}"),
                elapsed: started.elapsed(),
            },
            Err(_) => {
                abort.abort();
                AttemptOutcome::Transport {
                    kind: TransportErrorKind::Timeout,
                    message: format!(
                        "Attempt exceeded {} ms",
                        self.config.attempt_timeout.as_millis()
                    ),
                    elapsed: started.elapsed(),
                }
            }
        }
    }

    /// Write a transition to the queue, retrying transient write failures.
    ///
    /// A job no longer held by the worker that ran it is left alone.
    pub async fn commit<R: DispatchReporter + ?Sized>(
        &self,
        job: &Job,
        transition: Transition,
        reporter: &R,
    ) {
        if let Transition::Abandon(reason) = &transition {
            reporter.report(DispatchEvent::Abandoned {
                job_id: job.id,
                reason: reason.as_str(),
            });
            return;
        }

        let worker_id = owner(job);
        let mut tries = 0;
        loop {
            tries += 1;
            let written = match &transition {
                Transition::Succeed(result) => {
                    self.queue
                        .mark_terminal(job.id, worker_id, JobOutcome::Succeeded(result.clone()))
                        .await
                }
                Transition::Fail(error) => {
                    self.queue
                        .mark_terminal(job.id, worker_id, JobOutcome::Failed(error.clone()))
                        .await
                }
                Transition::Retry(schedule) | Transition::Defer { schedule, .. } => {
                    self.queue
                        .schedule_retry(job.id, worker_id, schedule.clone())
                        .await
                }
                Transition::Abandon(_) => return,
            };

            match written {
                Ok(state) => {
                    report_committed(job.id, &transition, state, reporter);
                    return;
                }
                Err(AppError::OwnershipLost { .. }) => {
                    reporter.report(DispatchEvent::OwnershipLost {
                        job_id: job.id,
                        worker_id,
                    });
                    return;
                }
                Err(e) if tries < COMMIT_ATTEMPTS => {
                    tracing::warn!(job_id = %job.id, error = %e, tries, "Retrying job transition write");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(tries))).await;
                }
                Err(e) => {
                    reporter.report(DispatchEvent::CommitFailed {
                        job_id: job.id,
                        error: &e,
                    });
                    return;
                }
            }
        }
    }

    /// Queue depth, proxy health and (optionally) counters.
    pub async fn health(&self, metrics: Option<&MetricsReporter>) -> Result<HealthSnapshot, AppError> {
        Ok(HealthSnapshot {
            queue: QueueDepth::collect(&self.queue).await?,
            proxies: self.proxies.stats(),
            metrics: metrics.map(MetricsReporter::snapshot),
        })
    }
}

fn failure_of(outcome: &AttemptOutcome) -> JobError {
    match outcome.to_error() {
        Some(e) => JobError::from(&e),
        None => JobError::new(
            FailureKind::TargetRejection,
            format!("Unusable response (status {:?})", outcome.status()),
        ),
    }
}

fn report_committed<R: DispatchReporter + ?Sized>(
    job_id: Uuid,
    transition: &Transition,
    state: JobState,
    reporter: &R,
) {
    match (state, transition) {
        (JobState::Succeeded, Transition::Succeed(result)) => {
            reporter.report(DispatchEvent::JobSucceeded {
                job_id,
                status: result.status,
            });
        }
        (JobState::Failed, Transition::Fail(error)) => {
            reporter.report(DispatchEvent::JobFailed { job_id, error });
        }
        // A cancelled job turns its next retry into a failure.
        (JobState::Failed, Transition::Retry(_) | Transition::Defer { .. }) => {
            reporter.report(DispatchEvent::JobFailed {
                job_id,
                error: &JobError::cancelled(),
            });
        }
        (JobState::RetryScheduled, Transition::Defer { reason, .. }) => {
            reporter.report(DispatchEvent::Deferred {
                job_id,
                reason: *reason,
            });
        }
        (JobState::RetryScheduled, Transition::Retry(schedule)) => {
            reporter.report(DispatchEvent::RetryScheduled {
                job_id,
                not_before: schedule.not_before,
            });
        }
        (state, _) => {
            tracing::debug!(%job_id, %state, "Job was already terminal");
        }
    }
}
