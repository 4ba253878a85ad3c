use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use ferry_core::error::{AppError, FailureKind};
use ferry_core::job::{
    CancelOutcome, EnqueueRequest, JobError, JobOutcome, JobResult, JobState, RetrySchedule,
};
use ferry_core::job_queue::{JobQueue, QueueDepth};
use ferry_db::FetchJobRepository;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn req(url: &str, priority: u8) -> EnqueueRequest {
    EnqueueRequest::with_raw_priority(url, priority).unwrap()
}

#[tokio::test]
async fn enqueue_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let job = repo.enqueue(req("https://Example.com/a", 2)).await.unwrap();

    assert_eq!(job.url, "https://Example.com/a");
    assert_eq!(job.domain, "example.com");
    assert_eq!(job.priority.value(), 2);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.worker_id.is_none());
    assert!(job.result.is_none());

    let fetched = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, job.id);
}

#[tokio::test]
async fn enqueue_rejects_bad_url_without_writing() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let err = repo.enqueue(req("ftp://example.com", 3)).await.unwrap_err();
    assert!(matches!(err, AppError::ConfigError(_)));
    assert_eq!(repo.count_by_state(JobState::Pending).await.unwrap(), 0);
}

#[tokio::test]
async fn custom_max_attempts_is_stored() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool).with_default_max_attempts(7);

    let defaulted = repo.enqueue(req("https://example.com/a", 3)).await.unwrap();
    let explicit = repo
        .enqueue(req("https://example.com/b", 3).with_max_attempts(2))
        .await
        .unwrap();

    assert_eq!(defaulted.max_attempts, 7);
    assert_eq!(explicit.max_attempts, 2);
}

#[tokio::test]
async fn claim_orders_by_priority_then_fifo() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    let low = repo.enqueue(req("https://a.com/low", 5)).await.unwrap();
    let first_mid = repo.enqueue(req("https://a.com/mid1", 3)).await.unwrap();
    let second_mid = repo.enqueue(req("https://a.com/mid2", 3)).await.unwrap();
    let high = repo.enqueue(req("https://a.com/high", 1)).await.unwrap();

    let now = Utc::now();
    assert_eq!(repo.peek_admissible(now).await.unwrap().unwrap().id, high.id);

    let mut order = Vec::new();
    while let Some(job) = repo.claim_next("worker-1", now).await.unwrap() {
        assert_eq!(job.state, JobState::InFlight);
        assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
        order.push(job.id);
    }
    assert_eq!(order, vec![high.id, first_mid.id, second_mid.id, low.id]);
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);

    for i in 0..20 {
        repo.enqueue(req(&format!("https://a.com/{i}"), 3))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..5 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let worker = format!("worker-{w}");
            let mut claimed = Vec::new();
            while let Some(job) = repo.claim_next(&worker, Utc::now()).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
async fn mark_in_flight_respects_owner() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 3)).await.unwrap();

    assert!(repo.mark_in_flight(job.id, "w1").await.unwrap());
    assert!(repo.mark_in_flight(job.id, "w1").await.unwrap());
    assert!(!repo.mark_in_flight(job.id, "w2").await.unwrap());
    assert!(matches!(
        repo.mark_in_flight(Uuid::new_v4(), "w1").await,
        Err(AppError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn record_attempt_requires_in_flight() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 2)).await.unwrap();

    assert!(matches!(
        repo.record_attempt(job.id, "w1", None).await,
        Err(AppError::OwnershipLost { .. })
    ));

    repo.claim_next("w1", Utc::now()).await.unwrap();
    assert_eq!(repo.record_attempt(job.id, "w1", Some("p1")).await.unwrap(), 1);
    assert_eq!(repo.record_attempt(job.id, "w1", Some("p2")).await.unwrap(), 2);
    assert!(matches!(
        repo.record_attempt(job.id, "w2", Some("p3")).await,
        Err(AppError::OwnershipLost { .. })
    ));
    assert!(matches!(
        repo.record_attempt(Uuid::new_v4(), "w1", None).await,
        Err(AppError::JobNotFound(_))
    ));

    let status = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(status.attempt_count, 2);
    assert_eq!(status.last_proxy.as_deref(), Some("p2"));
}

#[tokio::test]
async fn retry_is_invisible_until_not_before() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 3)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();

    let not_before = Utc::now() + TimeDelta::seconds(30);
    let state = repo
        .schedule_retry(
            job.id,
            "w1",
            RetrySchedule::at(not_before).with_error(JobError::new(
                FailureKind::TransientNetwork,
                "HTTP 503",
            )),
        )
        .await
        .unwrap();
    assert_eq!(state, JobState::RetryScheduled);

    assert!(repo.claim_next("w1", Utc::now()).await.unwrap().is_none());
    let later = not_before + TimeDelta::seconds(1);
    let claimed = repo.claim_next("w2", later).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert!(claimed.not_before.is_none());
    let error = claimed.last_error.unwrap();
    assert_eq!(error.kind, FailureKind::TransientNetwork);
    assert_eq!(error.message, "HTTP 503");
}

#[tokio::test]
async fn captcha_token_survives_retry() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 3)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();

    repo.schedule_retry(
        job.id,
        "w1",
        RetrySchedule::at(Utc::now()).with_captcha(Some("tok-1".into()), 1),
    )
    .await
    .unwrap();

    let claimed = repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.captcha_token.as_deref(), Some("tok-1"));
    assert_eq!(claimed.captcha_attempts, 1);

    repo.schedule_retry(job.id, "w1", RetrySchedule::at(Utc::now()))
        .await
        .unwrap();
    let status = repo.get_status(job.id).await.unwrap().unwrap();
    assert!(status.captcha_token.is_none());
}

#[tokio::test]
async fn terminal_is_final() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 2)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();

    let result = JobResult::new(200, "<html>ok</html>".into());
    let state = repo
        .mark_terminal(job.id, "w1", JobOutcome::Succeeded(result.clone()))
        .await
        .unwrap();
    assert_eq!(state, JobState::Succeeded);

    let state = repo
        .mark_terminal(
            job.id,
            "w1",
            JobOutcome::Failed(JobError::new(FailureKind::TargetRejection, "HTTP 404")),
        )
        .await
        .unwrap();
    assert_eq!(state, JobState::Succeeded);

    let state = repo
        .schedule_retry(job.id, "w1", RetrySchedule::at(Utc::now()))
        .await
        .unwrap();
    assert_eq!(state, JobState::Succeeded);

    let status = repo.get_status(job.id).await.unwrap().unwrap();
    let stored = status.result.unwrap();
    assert_eq!(stored.status, 200);
    assert_eq!(stored.body, result.body);
    assert_eq!(stored.content_hash, result.content_hash);
    assert!(status.worker_id.is_none());
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn failure_records_last_error() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 2)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();

    repo.mark_terminal(
        job.id,
        "w1",
        JobOutcome::Failed(JobError::new(FailureKind::TargetRejection, "HTTP 404")),
    )
    .await
    .unwrap();

    let status = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.result.is_none());
    assert_eq!(status.last_error.unwrap().kind, FailureKind::TargetRejection);
}

#[tokio::test]
async fn cancel_pending_removes_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 2)).await.unwrap();

    assert_eq!(repo.cancel(job.id).await.unwrap(), CancelOutcome::Removed);
    assert!(repo.get_status(job.id).await.unwrap().is_none());
    assert_eq!(repo.cancel(job.id).await.unwrap(), CancelOutcome::NotFound);
}

#[tokio::test]
async fn cancel_in_flight_prevents_next_retry() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 2)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();

    assert_eq!(repo.cancel(job.id).await.unwrap(), CancelOutcome::Flagged);
    let state = repo
        .schedule_retry(job.id, "w1", RetrySchedule::at(Utc::now()))
        .await
        .unwrap();
    assert_eq!(state, JobState::Failed);

    let status = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(status.last_error.unwrap().kind, FailureKind::Cancelled);
    assert_eq!(
        repo.cancel(job.id).await.unwrap(),
        CancelOutcome::AlreadyTerminal
    );
}

#[tokio::test]
async fn cancel_in_flight_still_records_success() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://example.com", 2)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();
    repo.cancel(job.id).await.unwrap();

    let state = repo
        .mark_terminal(
            job.id,
            "w1",
            JobOutcome::Succeeded(JobResult::new(200, "ok".into())),
        )
        .await
        .unwrap();
    assert_eq!(state, JobState::Succeeded);
}

#[tokio::test]
async fn recover_stale_requeues_silent_jobs() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let stale = repo.enqueue(req("https://a.com/1", 3)).await.unwrap();
    let flagged = repo.enqueue(req("https://a.com/2", 3)).await.unwrap();
    repo.claim_next("dead", Utc::now()).await.unwrap();
    repo.claim_next("dead", Utc::now()).await.unwrap();
    repo.cancel(flagged.id).await.unwrap();

    assert_eq!(repo.recover_stale(Duration::from_secs(60)).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        repo.recover_stale(Duration::from_millis(100)).await.unwrap(),
        2
    );

    let stale = repo.get_status(stale.id).await.unwrap().unwrap();
    assert_eq!(stale.state, JobState::Pending);
    assert!(stale.worker_id.is_none());
    let flagged = repo.get_status(flagged.id).await.unwrap().unwrap();
    assert_eq!(flagged.state, JobState::Failed);
    assert_eq!(flagged.last_error.unwrap().kind, FailureKind::Cancelled);
}

#[tokio::test]
async fn recovered_worker_cannot_overwrite_new_owner() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let job = repo.enqueue(req("https://a.com/slow", 3)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    repo.record_attempt(job.id, "w1", None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        repo.recover_stale(Duration::from_millis(100)).await.unwrap(),
        1
    );
    let reclaimed = repo.claim_next("w2", Utc::now()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);

    let late_retry = repo
        .schedule_retry(job.id, "w1", RetrySchedule::at(Utc::now()))
        .await;
    assert!(matches!(late_retry, Err(AppError::OwnershipLost { .. })));
    let late_result = repo
        .mark_terminal(
            job.id,
            "w1",
            JobOutcome::Succeeded(JobResult::new(200, "stale".into())),
        )
        .await;
    assert!(matches!(late_result, Err(AppError::OwnershipLost { .. })));

    assert!(repo.claim_next("w3", Utc::now()).await.unwrap().is_none());
    let status = repo.get_status(job.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::InFlight);
    assert_eq!(status.worker_id.as_deref(), Some("w2"));
    assert!(status.result.is_none());

    let state = repo
        .mark_terminal(
            job.id,
            "w2",
            JobOutcome::Succeeded(JobResult::new(200, "fresh".into())),
        )
        .await
        .unwrap();
    assert_eq!(state, JobState::Succeeded);
}

#[tokio::test]
async fn release_worker_jobs_only_touches_that_worker() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    repo.enqueue(req("https://a.com/1", 3)).await.unwrap();
    repo.enqueue(req("https://a.com/2", 3)).await.unwrap();
    let mine = repo.claim_next("w1", Utc::now()).await.unwrap().unwrap();
    let theirs = repo.claim_next("w2", Utc::now()).await.unwrap().unwrap();

    assert_eq!(repo.release_worker_jobs("w1").await.unwrap(), 1);
    assert_eq!(
        repo.get_status(mine.id).await.unwrap().unwrap().state,
        JobState::Pending
    );
    assert_eq!(
        repo.get_status(theirs.id).await.unwrap().unwrap().state,
        JobState::InFlight
    );
}

#[tokio::test]
async fn list_and_count_by_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = FetchJobRepository::new(pool);
    let first = repo.enqueue(req("https://a.com/1", 3)).await.unwrap();
    repo.enqueue(req("https://a.com/2", 3)).await.unwrap();
    let third = repo.enqueue(req("https://a.com/3", 3)).await.unwrap();
    repo.claim_next("w1", Utc::now()).await.unwrap();

    let depth = QueueDepth::collect(&repo).await.unwrap();
    assert_eq!(depth.pending, 2);
    assert_eq!(depth.in_flight, 1);
    assert_eq!(depth.outstanding(), 3);

    let all = repo.list_jobs(None, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].id, first.id);

    let pending = repo.list_jobs(Some(JobState::Pending), 1).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, third.id);
    assert_eq!(
        repo.list_jobs(Some(JobState::InFlight), 10).await.unwrap()[0].id,
        first.id
    );
}
