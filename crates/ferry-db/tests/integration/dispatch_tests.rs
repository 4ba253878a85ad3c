use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_core::captcha::{CaptchaConfig, CaptchaGate, Challenge};
use chrono::Utc;
use ferry_core::dispatcher::{Dispatcher, DispatcherConfig, MetricsReporter, Transition};
use ferry_core::error::{AppError, FailureKind};
use ferry_core::job::{EnqueueRequest, JobResult, JobState};
use ferry_core::job_queue::{JobQueue, QueueDepth};
use ferry_core::limiter::{DomainLimitConfig, DomainRateLimiter};
use ferry_core::proxy::{ProxyLease, ProxyPool, ProxyPoolConfig};
use ferry_core::retry::RetryPolicy;
use ferry_core::traits::{AttemptOutcome, CaptchaSolver, FetchExecutor};
use ferry_db::FetchJobRepository;
use tokio_util::sync::CancellationToken;

use crate::integration::common::setup_test_db;

/// Answers each URL from its own queue of statuses, then 200.
#[derive(Clone, Default)]
struct StatusScript {
    statuses: Arc<Mutex<Vec<(String, VecDeque<u16>)>>>,
}

impl StatusScript {
    fn with(self, url: &str, statuses: &[u16]) -> Self {
        self.statuses
            .lock()
            .unwrap()
            .push((url.to_string(), statuses.iter().copied().collect()));
        self
    }
}

impl FetchExecutor for StatusScript {
    async fn execute(
        &self,
        url: &str,
        _proxy: &ProxyLease,
        _captcha_token: Option<&str>,
    ) -> AttemptOutcome {
        let status = self
            .statuses
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(u, _)| u == url)
            .and_then(|(_, queue)| queue.pop_front())
            .unwrap_or(200);
        AttemptOutcome::response(status, format!("<html>{status}</html>"))
    }
}

#[derive(Clone)]
struct NoSolver;

impl CaptchaSolver for NoSolver {
    async fn solve(&self, _challenge: &Challenge) -> Result<String, AppError> {
        Err(AppError::CaptchaSolver("no solver configured".into()))
    }
}

fn dispatcher(
    repo: &FetchJobRepository,
    executor: StatusScript,
    policy: RetryPolicy,
) -> Dispatcher<FetchJobRepository, StatusScript, NoSolver> {
    let captcha = CaptchaConfig::default().with_solve_timeout(Duration::from_secs(1));
    Dispatcher::new(
        repo.clone(),
        executor,
        ProxyPool::new(Vec::new(), ProxyPoolConfig::default().with_allow_direct(true)).unwrap(),
        DomainRateLimiter::new(DomainLimitConfig::default().with_default_limit(4, Duration::ZERO))
            .unwrap(),
        CaptchaGate::new(NoSolver, &captcha).unwrap(),
        policy
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(0.0),
        DispatcherConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(10), Duration::from_millis(50))
            .with_attempt_timeout(Duration::from_secs(1))
            .with_stale_after(Duration::from_secs(10)),
    )
    .unwrap()
}

async fn run_until_settled(
    repo: &FetchJobRepository,
    dispatcher: &Dispatcher<FetchJobRepository, StatusScript, NoSolver>,
) -> Arc<MetricsReporter> {
    let metrics = Arc::new(MetricsReporter::new());
    let cancel = CancellationToken::new();
    let runner = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move { dispatcher.run(cancel, metrics).await })
    };

    tokio::time::timeout(Duration::from_secs(20), async {
        while QueueDepth::collect(repo).await.unwrap().outstanding() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("jobs did not settle");
    cancel.cancel();
    runner.await.unwrap().unwrap();
    metrics
}

#[tokio::test]
async fn dispatcher_drives_jobs_to_terminal_states() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let flaky = repo
        .enqueue(EnqueueRequest::with_raw_priority("https://flaky.test/", 2).unwrap())
        .await
        .unwrap();
    let missing = repo
        .enqueue(EnqueueRequest::with_raw_priority("https://gone.test/", 3).unwrap())
        .await
        .unwrap();

    let executor = StatusScript::default()
        .with("https://flaky.test/", &[503])
        .with("https://gone.test/", &[404]);
    let dispatcher = dispatcher(&repo, executor, RetryPolicy::default());
    let metrics = run_until_settled(&repo, &dispatcher).await;

    let flaky = repo.get_status(flaky.id).await.unwrap().unwrap();
    assert_eq!(flaky.state, JobState::Succeeded);
    assert_eq!(flaky.attempt_count, 2);
    assert_eq!(flaky.result.unwrap().status, 200);

    let missing = repo.get_status(missing.id).await.unwrap().unwrap();
    assert_eq!(missing.state, JobState::Failed);
    assert_eq!(missing.attempt_count, 1);
    assert_eq!(missing.last_error.unwrap().kind, FailureKind::TargetRejection);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.succeeded, 1);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(repo.count_by_state(JobState::InFlight).await.unwrap(), 0);
}

#[tokio::test]
async fn policy_ceiling_caps_stored_job_limit() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let job = repo
        .enqueue(
            EnqueueRequest::with_raw_priority("https://busy.test/", 2)
                .unwrap()
                .with_max_attempts(5),
        )
        .await
        .unwrap();

    let executor = StatusScript::default().with("https://busy.test/", &[503, 503, 503, 503]);
    let dispatcher = dispatcher(&repo, executor, RetryPolicy::default().with_max_attempts(2));
    run_until_settled(&repo, &dispatcher).await;

    let job = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.attempt_count, 2);
}

#[tokio::test]
async fn recovered_worker_result_is_dropped() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let job = repo
        .enqueue(EnqueueRequest::with_raw_priority("https://slow.test/", 2).unwrap())
        .await
        .unwrap();
    let dispatcher = dispatcher(&repo, StatusScript::default(), RetryPolicy::default());
    let metrics = Arc::new(MetricsReporter::new());

    let slow = repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    let transition = dispatcher.step(&slow, metrics.as_ref()).await;
    assert!(matches!(transition, Transition::Succeed(_)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(repo.recover_stale(Duration::from_millis(100)).await.unwrap(), 1);
    let current = repo.claim_next("w2", Utc::now()).await.unwrap().unwrap();
    assert_eq!(current.id, job.id);

    dispatcher.commit(&slow, transition, metrics.as_ref()).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.ownership_lost, 1);
    assert_eq!(snapshot.succeeded, 0);

    let held = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(held.state, JobState::InFlight);
    assert_eq!(held.worker_id.as_deref(), Some("w2"));

    dispatcher
        .commit(
            &current,
            Transition::Succeed(JobResult::new(200, "fresh".into())),
            metrics.as_ref(),
        )
        .await;
    let done = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.result.unwrap().body, "fresh");
}
