//! Attempt classification and retry backoff.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::captcha::Challenge;
use crate::error::AppError;
use crate::traits::{AttemptOutcome, TransportErrorKind};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What the dispatcher should do with an attempt's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Success,
    RetryableFailure,
    CaptchaChallenge,
    FatalFailure,
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeClass::Success => "success",
            OutcomeClass::RetryableFailure => "retryable",
            OutcomeClass::CaptchaChallenge => "captcha",
            OutcomeClass::FatalFailure => "fatal",
        };
        write!(f, "{s}")
    }
}

/// One execution of a job. Logged and classified, never persisted.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub job_id: Uuid,
    pub proxy_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub challenge: Option<Challenge>,
}

impl Attempt {
    pub fn status(&self) -> Option<u16> {
        self.outcome.status()
    }

    pub fn captcha_detected(&self) -> bool {
        self.challenge.is_some()
    }
}

/// Retry ceiling and exponential backoff with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts a job may consume, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Each delay is scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// CAPTCHA challenges tolerated before the job fails.
    pub captcha_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
            captcha_max_attempts: 2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_captcha_max_attempts(mut self, max: u32) -> Self {
        self.captcha_max_attempts = max;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::ConfigError("max_attempts must be at least 1".into()));
        }
        if self.captcha_max_attempts == 0 {
            return Err(AppError::ConfigError(
                "captcha_max_attempts must be at least 1".into(),
            ));
        }
        if self.multiplier < 1.0 {
            return Err(AppError::ConfigError(format!(
                "Backoff multiplier {} must be >= 1.0",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(AppError::ConfigError(format!(
                "Jitter {} must be in [0, 1)",
                self.jitter
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(AppError::ConfigError(
                "base_delay must not exceed max_delay".into(),
            ));
        }
        Ok(())
    }

    /// Classify an attempt from its outcome alone.
    pub fn classify(&self, attempt: &Attempt) -> OutcomeClass {
        if attempt.challenge.is_some() {
            return OutcomeClass::CaptchaChallenge;
        }
        match &attempt.outcome {
            AttemptOutcome::Transport { kind, .. } => match kind {
                TransportErrorKind::InvalidUrl => OutcomeClass::FatalFailure,
                _ => OutcomeClass::RetryableFailure,
            },
            AttemptOutcome::Response { status, .. } => match *status {
                200..=299 => OutcomeClass::Success,
                408 | 429 => OutcomeClass::RetryableFailure,
                500..=599 => OutcomeClass::RetryableFailure,
                _ => OutcomeClass::FatalFailure,
            },
        }
    }

    /// Attempt ceiling for a job: its own limit, capped by this policy.
    pub fn ceiling_for(&self, job_max_attempts: u32) -> u32 {
        job_max_attempts.min(self.max_attempts)
    }

    /// Apply an attempt ceiling. `attempts_used` counts the attempts charged
    /// against it, this one included.
    ///
    /// A retryable outcome on the last allowed attempt becomes fatal so the
    /// charged attempts never go past the ceiling.
    pub fn apply_ceiling(
        &self,
        class: OutcomeClass,
        attempts_used: u32,
        max_attempts: u32,
    ) -> OutcomeClass {
        if class == OutcomeClass::RetryableFailure && attempts_used >= max_attempts {
            OutcomeClass::FatalFailure
        } else {
            class
        }
    }

    /// Backoff before the attempt following attempt number `attempt_count`.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(32) as i32;
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let factor = if self.jitter > 0.0 {
            rand::random_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        let secs = (base * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Whether one more CAPTCHA challenge is allowed after `captcha_attempts`.
    pub fn captcha_budget_left(&self, captcha_attempts: u32) -> bool {
        captcha_attempts < self.captcha_max_attempts
    }
}
