use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, FailureKind};

/// Lifecycle state of a fetch job.
///
/// ```text
/// pending ──> in_flight ──> succeeded
///                 │    └──> failed
///                 v
///          retry_scheduled ──> in_flight ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::InFlight,
        JobState::RetryScheduled,
        JobState::Succeeded,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::RetryScheduled => "retry_scheduled",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Pending or retry-scheduled: eligible for dispatch once `not_before` passes.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Pending | JobState::RetryScheduled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(JobState::Pending),
            "in_flight" => Ok(JobState::InFlight),
            "retry_scheduled" => Ok(JobState::RetryScheduled),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Job priority, 1 (highest) to 5 (lowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const LOWEST: Priority = Priority(5);

    pub fn new(value: u8) -> Result<Self, AppError> {
        if (Self::HIGHEST.0..=Self::LOWEST.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(AppError::ConfigError(format!(
                "Priority {value} out of range (1 highest – 5 lowest)"
            )))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u8> for Priority {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The error a job carries after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Job cancelled")
    }
}

impl From<&AppError> for JobError {
    fn from(err: &AppError) -> Self {
        Self::new(err.failure_kind(), err.to_string())
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Content delivered for a succeeded job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: u16,
    pub body: String,
    /// SHA-256 of the body, hex encoded.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(status: u16, body: String) -> Self {
        let content_hash = compute_hash(&body);
        Self {
            status,
            body,
            content_hash,
            fetched_at: Utc::now(),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A fetch job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub url: String,
    /// Lower-cased host of `url`; the unit of rate limiting.
    pub domain: String,
    pub priority: Priority,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub captcha_attempts: u32,
    /// Invisible to dispatch until this instant passes.
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
    pub last_proxy: Option<String>,
    /// Solved CAPTCHA token to present on the next attempt.
    pub captcha_token: Option<String>,
    pub cancel_requested: bool,
    pub result: Option<JobResult>,
    pub worker_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh pending job from a validated request.
    pub fn from_request(request: &EnqueueRequest, default_max_attempts: u32) -> Result<Self, AppError> {
        let domain = validate_target(&request.url)?;
        let max_attempts = request.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(AppError::ConfigError(
                "max_attempts must be at least 1".into(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            url: request.url.clone(),
            domain,
            priority: request.priority,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts,
            captcha_attempts: 0,
            not_before: None,
            last_error: None,
            last_proxy: None,
            captcha_token: None,
            cancel_requested: false,
            result: None,
            worker_id: None,
            submitted_at: now,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the job may be dispatched at `now`.
    pub fn is_admissible(&self, now: DateTime<Utc>) -> bool {
        self.state.is_waiting() && self.not_before.is_none_or(|t| t <= now)
    }

    /// Attempts charged against the retry ceiling. Attempts that ran into a
    /// CAPTCHA challenge count against the CAPTCHA ceiling instead.
    pub fn standard_attempts(&self) -> u32 {
        self.attempt_count.saturating_sub(self.captcha_attempts)
    }
}

/// Validate a target URL and return its rate-limiting domain.
///
/// Only absolute `http`/`https` URLs with a host are accepted.
pub fn validate_target(url: &str) -> Result<String, AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::ConfigError(format!("Invalid URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::ConfigError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| AppError::ConfigError(format!("URL '{url}' has no host")))
}

/// Request to enqueue a new job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub url: String,
    pub priority: Priority,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(url: impl Into<String>, priority: Priority) -> Self {
        Self {
            url: url.into(),
            priority,
            max_attempts: None,
        }
    }

    /// Build from a raw priority value, rejecting anything outside 1–5.
    pub fn with_raw_priority(url: impl Into<String>, priority: u8) -> Result<Self, AppError> {
        Ok(Self::new(url, Priority::new(priority)?))
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Terminal outcome handed to `JobQueue::mark_terminal`.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(JobResult),
    Failed(JobError),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded(_) => JobState::Succeeded,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }
}

/// Everything written when a job goes back to `retry_scheduled`.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub not_before: DateTime<Utc>,
    pub error: Option<JobError>,
    /// Token for the next attempt; `None` clears any previous token.
    pub captcha_token: Option<String>,
    pub captcha_attempts: u32,
}

impl RetrySchedule {
    pub fn at(not_before: DateTime<Utc>) -> Self {
        Self {
            not_before,
            error: None,
            captcha_token: None,
            captcha_attempts: 0,
        }
    }

    pub fn with_error(mut self, error: JobError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_captcha(mut self, token: Option<String>, captcha_attempts: u32) -> Self {
        self.captcha_token = token;
        self.captcha_attempts = captcha_attempts;
        self
    }
}

/// Result of an external cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Pending or retry-scheduled job removed from the queue.
    Removed,
    /// In-flight job flagged; its next retry will not happen.
    Flagged,
    /// Already terminal; nothing changed.
    AlreadyTerminal,
    NotFound,
}
