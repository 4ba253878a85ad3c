use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types for Ferry.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid job or pool parameters. Rejected at admission, never retried.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Timeout, reset, refused connection or an upstream 5xx.
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// The target answered with a CAPTCHA challenge.
    #[error("CAPTCHA challenge: {0}")]
    CaptchaChallenge(String),

    /// The target rejected the request (4xx other than challenge codes).
    #[error("Target rejected request (HTTP {status}): {message}")]
    TargetRejection { status: u16, message: String },

    /// No proxy or domain slot available right now.
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Queue or result store unreachable.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The job is no longer in flight for this worker (recovered, reclaimed
    /// or finished elsewhere). The caller's result must be dropped.
    #[error("Job {job_id} is no longer held by {worker_id}")]
    OwnershipLost { job_id: Uuid, worker_id: String },

    /// The external CAPTCHA solving service failed.
    #[error("CAPTCHA solver error: {0}")]
    CaptchaSolver(String),

    /// Request timed out.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransientNetwork(_)
            | AppError::Timeout(_)
            | AppError::CapacityExhausted(_)
            | AppError::CaptchaSolver(_) => true,
            AppError::TargetRejection { status, .. } => *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// The kind recorded on a job that ends in `failed` because of this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::ConfigError(_) => FailureKind::Configuration,
            AppError::TransientNetwork(_) | AppError::Timeout(_) => FailureKind::TransientNetwork,
            AppError::CaptchaChallenge(_) | AppError::CaptchaSolver(_) => FailureKind::Captcha,
            AppError::TargetRejection { .. } => FailureKind::TargetRejection,
            AppError::CapacityExhausted(_) => FailureKind::CapacityExhausted,
            AppError::PersistenceError(_)
            | AppError::JobNotFound(_)
            | AppError::OwnershipLost { .. }
            | AppError::SerializationError(_) => FailureKind::Persistence,
        }
    }
}

/// Failure category stored with a job's last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    TransientNetwork,
    Captcha,
    TargetRejection,
    CapacityExhausted,
    Persistence,
    Cancelled,
}

impl FailureKind {
    pub const ALL: [FailureKind; 7] = [
        FailureKind::Configuration,
        FailureKind::TransientNetwork,
        FailureKind::Captcha,
        FailureKind::TargetRejection,
        FailureKind::CapacityExhausted,
        FailureKind::Persistence,
        FailureKind::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::Captcha => "captcha",
            FailureKind::TargetRejection => "target_rejection",
            FailureKind::CapacityExhausted => "capacity_exhausted",
            FailureKind::Persistence => "persistence",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown failure kind: {s}"))
    }
}
