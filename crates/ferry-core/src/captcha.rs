//! CAPTCHA detection and solving.
//!
//! [`ChallengeDetector`] decides whether a response is a challenge page;
//! [`CaptchaGate`] hands detected challenges to a [`CaptchaSolver`] under its
//! own timeout and turns the answer into a token for the next attempt.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::AppError;
use crate::job::Job;
use crate::traits::CaptchaSolver;

/// Challenge vendor, as far as the page markers tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Recaptcha,
    HCaptcha,
    Turnstile,
    Unknown,
}

/// Descriptor handed to the solving service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Challenge {
    pub url: String,
    pub status: Option<u16>,
    pub kind: ChallengeKind,
    /// `data-sitekey` attribute of the widget, when the page has one.
    pub site_key: Option<String>,
}

/// Configuration for challenge detection and solving.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    /// Statuses that always mean "challenge", whatever the body says.
    pub challenge_statuses: Vec<u16>,
    /// Case-insensitive widget markers. Ordinary pages embed these widgets
    /// too (login and contact forms), so they only count under
    /// `marker_statuses`.
    pub markers: Vec<String>,
    /// Statuses under which a widget marker means "challenge".
    pub marker_statuses: Vec<u16>,
    /// Case-insensitive markers of an interstitial challenge page. These
    /// count on any status.
    pub page_markers: Vec<String>,
    /// Upper bound for one `solve` call.
    pub solve_timeout: Duration,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            challenge_statuses: Vec::new(),
            markers: strings(&[
                "g-recaptcha",
                "recaptcha/api.js",
                "h-captcha",
                "hcaptcha.com",
                "cf-turnstile",
                "challenges.cloudflare.com",
            ]),
            marker_statuses: vec![403, 429, 503],
            page_markers: strings(&["cf-chl-", "_cf_chl_opt"]),
            solve_timeout: Duration::from_secs(120),
        }
    }
}

impl CaptchaConfig {
    pub fn with_challenge_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.challenge_statuses = statuses;
        self
    }

    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_marker_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.marker_statuses = statuses;
        self
    }

    pub fn with_page_markers(mut self, markers: Vec<String>) -> Self {
        self.page_markers = markers;
        self
    }

    pub fn with_solve_timeout(mut self, timeout: Duration) -> Self {
        self.solve_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.solve_timeout.is_zero() {
            return Err(AppError::ConfigError("solve_timeout must be non-zero".into()));
        }
        let mut statuses = self.challenge_statuses.iter().chain(&self.marker_statuses);
        if let Some(s) = statuses.find(|s| (200..300).contains(*s)) {
            return Err(AppError::ConfigError(format!(
                "Status {s} cannot be a challenge status"
            )));
        }
        Ok(())
    }
}

fn lowercased(markers: &[String]) -> Vec<String> {
    markers.iter().map(|m| m.to_lowercase()).collect()
}

/// Recognises challenge pages by status code and body markers.
#[derive(Debug, Clone)]
pub struct ChallengeDetector {
    statuses: Vec<u16>,
    marker_statuses: Vec<u16>,
    markers: Vec<String>,
    page_markers: Vec<String>,
}

impl ChallengeDetector {
    pub fn new(config: &CaptchaConfig) -> Self {
        Self {
            statuses: config.challenge_statuses.clone(),
            marker_statuses: config.marker_statuses.clone(),
            markers: lowercased(&config.markers),
            page_markers: lowercased(&config.page_markers),
        }
    }

    pub fn detect(&self, url: &str, status: u16, body: &str) -> Option<Challenge> {
        let lower = body.to_lowercase();
        let contains_any = |markers: &[String]| markers.iter().any(|m| lower.contains(m.as_str()));
        let challenged = self.statuses.contains(&status)
            || contains_any(&self.page_markers)
            || (self.marker_statuses.contains(&status) && contains_any(&self.markers));
        if !challenged {
            return None;
        }
        Some(Challenge {
            url: url.to_string(),
            status: Some(status),
            kind: challenge_kind(&lower),
            site_key: extract_site_key(body),
        })
    }
}

fn challenge_kind(lower_body: &str) -> ChallengeKind {
    if lower_body.contains("h-captcha") || lower_body.contains("hcaptcha.com") {
        ChallengeKind::HCaptcha
    } else if lower_body.contains("cf-turnstile") || lower_body.contains("challenges.cloudflare.com")
    {
        ChallengeKind::Turnstile
    } else if lower_body.contains("recaptcha") {
        ChallengeKind::Recaptcha
    } else {
        ChallengeKind::Unknown
    }
}

fn extract_site_key(body: &str) -> Option<String> {
    const ATTR: &str = "data-sitekey=";
    let start = body.find(ATTR)? + ATTR.len();
    let rest = &body[start..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    let end = value.find(quote)?;
    Some(value[..end].to_string()).filter(|k| !k.is_empty())
}

/// Answer from the gate for one challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaResolution {
    Resolved(String),
    Unresolved(String),
}

impl fmt::Display for CaptchaResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptchaResolution::Resolved(_) => write!(f, "resolved"),
            CaptchaResolution::Unresolved(reason) => write!(f, "unresolved: {reason}"),
        }
    }
}

/// Routes detected challenges to the solving service.
#[derive(Clone)]
pub struct CaptchaGate<S> {
    solver: S,
    detector: ChallengeDetector,
    solve_timeout: Duration,
}

impl<S: CaptchaSolver> CaptchaGate<S> {
    pub fn new(solver: S, config: &CaptchaConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            solver,
            detector: ChallengeDetector::new(config),
            solve_timeout: config.solve_timeout,
        })
    }

    pub fn detector(&self) -> &ChallengeDetector {
        &self.detector
    }

    pub fn solve_timeout(&self) -> Duration {
        self.solve_timeout
    }

    /// Ask the solver for a token. Failures and timeouts come back as
    /// [`CaptchaResolution::Unresolved`], never as errors.
    pub async fn handle_challenge(&self, job: &Job, challenge: &Challenge) -> CaptchaResolution {
        tracing::info!(
            job_id = %job.id,
            kind = ?challenge.kind,
            site_key = ?challenge.site_key,
            "Solving CAPTCHA challenge"
        );
        match tokio::time::timeout(self.solve_timeout, self.solver.solve(challenge)).await {
            Ok(Ok(token)) if !token.is_empty() => CaptchaResolution::Resolved(token),
            Ok(Ok(_)) => CaptchaResolution::Unresolved("Solver returned an empty token".into()),
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.id, error = %e, "CAPTCHA solver failed");
                CaptchaResolution::Unresolved(e.to_string())
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job.id,
                    timeout_ms = self.solve_timeout.as_millis() as u64,
                    "CAPTCHA solver timed out"
                );
                CaptchaResolution::Unresolved(format!(
                    "Solver timed out after {} ms",
                    self.solve_timeout.as_millis()
                ))
            }
        }
    }
}
