//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::captcha::Challenge;
use crate::dispatcher::{DispatchEvent, DispatchReporter};
use crate::error::AppError;
use crate::proxy::ProxyLease;
use crate::traits::{AttemptOutcome, CaptchaSolver, FetchExecutor};

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

/// One recorded `execute` call.
#[derive(Debug, Clone)]
pub struct ExecutorCall {
    pub url: String,
    pub proxy_id: String,
    pub captcha_token: Option<String>,
}

/// Executor that plays back a script of outcomes.
///
/// Each call pops the first scripted outcome; once the script runs dry the
/// fallback (HTTP 200 by default) is returned. Tracks how many calls per host
/// were running at once.
#[derive(Clone)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<VecDeque<AttemptOutcome>>>,
    fallback: AttemptOutcome,
    delay: Duration,
    calls: Arc<Mutex<Vec<ExecutorCall>>>,
    active: Arc<Mutex<HashMap<String, usize>>>,
    peak: Arc<Mutex<HashMap<String, usize>>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<AttemptOutcome>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: AttemptOutcome::response(200, "<html>ok</html>"),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
            peak: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Every call returns `outcome`.
    pub fn always(outcome: AttemptOutcome) -> Self {
        Self::new(Vec::new()).with_fallback(outcome)
    }

    pub fn with_fallback(mut self, outcome: AttemptOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of simultaneous calls observed for `host`.
    pub fn peak_concurrency(&self, host: &str) -> usize {
        self.peak.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

impl FetchExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        url: &str,
        proxy: &ProxyLease,
        captcha_token: Option<&str>,
    ) -> AttemptOutcome {
        let host = host_of(url);
        self.calls.lock().unwrap().push(ExecutorCall {
            url: url.to_string(),
            proxy_id: proxy.id.clone(),
            captcha_token: captcha_token.map(str::to_string),
        });
        {
            let mut active = self.active.lock().unwrap();
            let now = active.entry(host.clone()).or_insert(0);
            *now += 1;
            let mut peak = self.peak.lock().unwrap();
            let max = peak.entry(host.clone()).or_insert(0);
            *max = (*max).max(*now);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(n) = self.active.lock().unwrap().get_mut(&host) {
            *n -= 1;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// MockSolver
// ---------------------------------------------------------------------------

/// CAPTCHA solver with a fixed answer.
#[derive(Clone)]
pub struct MockSolver {
    token: Option<String>,
    delay: Duration,
    challenges: Arc<Mutex<Vec<Challenge>>>,
}

impl MockSolver {
    /// Solves every challenge with `token`.
    pub fn always(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            delay: Duration::ZERO,
            challenges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails every challenge.
    pub fn failing() -> Self {
        Self {
            token: None,
            delay: Duration::ZERO,
            challenges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.challenges.lock().unwrap().len()
    }
}

impl CaptchaSolver for MockSolver {
    async fn solve(&self, challenge: &Challenge) -> Result<String, AppError> {
        self.challenges.lock().unwrap().push(challenge.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.token
            .clone()
            .ok_or_else(|| AppError::CaptchaSolver("solver unavailable".into()))
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps the name of every event it sees.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == name)
            .count()
    }
}

impl DispatchReporter for RecordingReporter {
    fn report(&self, event: DispatchEvent<'_>) {
        self.events.lock().unwrap().push(event.name());
    }
}
