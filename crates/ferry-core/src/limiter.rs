//! Per-domain concurrency and spacing limits.
//!
//! A dispatch to a domain needs a [`DomainPermit`]. The permit is granted only
//! while the domain is below its concurrency cap and at least `min_spacing`
//! has passed since the previous grant. Dropping the permit gives the slot
//! back, so a slot is released exactly once whatever path the attempt takes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Limits for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLimit {
    pub max_concurrency: usize,
    pub min_spacing: Duration,
}

impl DomainLimit {
    pub fn new(max_concurrency: usize, min_spacing: Duration) -> Self {
        Self {
            max_concurrency,
            min_spacing,
        }
    }
}

/// Limiter configuration: a default limit plus per-domain overrides.
#[derive(Debug, Clone)]
pub struct DomainLimitConfig {
    pub default_limit: DomainLimit,
    pub overrides: HashMap<String, DomainLimit>,
    /// Upper bound on tracked domains. Idle windows beyond it are evicted,
    /// least recently dispatched first.
    pub max_domains: usize,
}

impl Default for DomainLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: DomainLimit::new(2, Duration::from_millis(500)),
            overrides: HashMap::new(),
            max_domains: 10_000,
        }
    }
}

impl DomainLimitConfig {
    pub fn with_default_limit(mut self, max_concurrency: usize, min_spacing: Duration) -> Self {
        self.default_limit = DomainLimit::new(max_concurrency, min_spacing);
        self
    }

    pub fn with_override(mut self, domain: impl Into<String>, limit: DomainLimit) -> Self {
        self.overrides.insert(domain.into().to_lowercase(), limit);
        self
    }

    pub fn with_max_domains(mut self, max: usize) -> Self {
        self.max_domains = max;
        self
    }

    pub fn limit_for(&self, domain: &str) -> DomainLimit {
        self.overrides
            .get(domain)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.default_limit.max_concurrency == 0 {
            return Err(AppError::ConfigError(
                "Domain max_concurrency must be at least 1".into(),
            ));
        }
        if let Some((domain, _)) = self.overrides.iter().find(|(_, l)| l.max_concurrency == 0) {
            return Err(AppError::ConfigError(format!(
                "Override for {domain} has max_concurrency 0"
            )));
        }
        if self.max_domains == 0 {
            return Err(AppError::ConfigError("max_domains must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DomainWindow {
    in_flight: usize,
    last_dispatch: Option<Instant>,
}

impl DomainWindow {
    fn idle(&self) -> bool {
        self.in_flight == 0
    }
}

type Windows = HashMap<String, DomainWindow>;

/// Thread-safe limiter shared by all workers. Clones share state.
#[derive(Clone)]
pub struct DomainRateLimiter {
    config: Arc<DomainLimitConfig>,
    windows: Arc<Mutex<Windows>>,
}

impl DomainRateLimiter {
    pub fn new(config: DomainLimitConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            windows: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn lock_windows(&self) -> MutexGuard<'_, Windows> {
        lock(&self.windows)
    }

    /// Take a slot for `domain`, or `None` if the domain is at its cap or
    /// was dispatched to less than `min_spacing` ago.
    pub fn try_acquire(&self, domain: &str) -> Option<DomainPermit> {
        let limit = self.config.limit_for(domain);
        let now = Instant::now();
        let mut windows = self.lock_windows();

        if !windows.contains_key(domain) && windows.len() >= self.config.max_domains {
            evict_idle(&mut windows, self.config.max_domains);
        }

        let window = windows.entry(domain.to_string()).or_default();
        if window.in_flight >= limit.max_concurrency {
            return None;
        }
        if let Some(last) = window.last_dispatch
            && now.duration_since(last) < limit.min_spacing
        {
            return None;
        }

        window.in_flight += 1;
        window.last_dispatch = Some(now);
        Some(DomainPermit {
            domain: domain.to_string(),
            windows: Arc::clone(&self.windows),
        })
    }

    pub fn in_flight(&self, domain: &str) -> usize {
        self.lock_windows()
            .get(domain)
            .map(|w| w.in_flight)
            .unwrap_or(0)
    }

    pub fn tracked_domains(&self) -> usize {
        self.lock_windows().len()
    }
}

fn lock(windows: &Mutex<Windows>) -> MutexGuard<'_, Windows> {
    windows.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned domain limiter mutex");
        poisoned.into_inner()
    })
}

/// Drop idle windows, oldest dispatch first, until there is room for one more.
fn evict_idle(windows: &mut Windows, max_domains: usize) {
    let mut idle: Vec<(String, Option<Instant>)> = windows
        .iter()
        .filter(|(_, w)| w.idle())
        .map(|(d, w)| (d.clone(), w.last_dispatch))
        .collect();
    idle.sort_by_key(|(_, last)| *last);

    let excess = (windows.len() + 1).saturating_sub(max_domains);
    for (domain, _) in idle.into_iter().take(excess) {
        windows.remove(&domain);
    }
    if windows.len() >= max_domains {
        tracing::debug!(
            tracked = windows.len(),
            "Domain limiter over capacity, every window is busy"
        );
    }
}

/// A held domain slot. Released on drop.
#[derive(Debug)]
pub struct DomainPermit {
    domain: String,
    windows: Arc<Mutex<Windows>>,
}

impl DomainPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        let mut windows = lock(&self.windows);
        if let Some(window) = windows.get_mut(&self.domain) {
            window.in_flight = window.in_flight.saturating_sub(1);
        }
    }
}
