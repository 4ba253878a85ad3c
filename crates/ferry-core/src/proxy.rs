//! Egress proxy pool with health tracking.
//!
//! # Proxy health
//!
//! ```text
//! HEALTHY --[failure]--> DEGRADED --[N consecutive failures]--> QUARANTINED
//!    ^                      |                                       |
//!    +------[success]-------+                              [cool-down elapsed]
//!    |                                                              v
//!    +-------------------[probe success]------------------------ PROBE
//!                                                                   |
//!                         QUARANTINED <-------[probe failure]-------+
//! ```
//!
//! Selection is round-robin over the inventory. Quarantined proxies are
//! skipped until their cool-down elapses; then exactly one attempt is routed
//! through them as a probe before they rejoin the rotation.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use url::Url;

use crate::error::AppError;

/// Lease id used when requests go out without a proxy.
pub const DIRECT_PROXY_ID: &str = "direct";

/// Health of a single proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyHealth {
    Healthy,
    Degraded,
    Quarantined,
}

impl fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyHealth::Healthy => write!(f, "healthy"),
            ProxyHealth::Degraded => write!(f, "degraded"),
            ProxyHealth::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Configuration for proxy health transitions.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures before a proxy is marked degraded.
    pub degrade_after: u32,

    /// Consecutive failures before a proxy is quarantined.
    pub quarantine_after: u32,

    /// Time a quarantined proxy sits out before it is probed.
    pub cool_down: Duration,

    /// With an empty inventory, hand out direct (proxy-less) leases instead
    /// of reporting a capacity shortage.
    pub allow_direct: bool,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            degrade_after: 1,
            quarantine_after: 3,
            cool_down: Duration::from_secs(60),
            allow_direct: false,
        }
    }
}

impl ProxyPoolConfig {
    pub fn with_quarantine_after(mut self, failures: u32) -> Self {
        self.quarantine_after = failures;
        self
    }

    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    pub fn with_allow_direct(mut self, allow: bool) -> Self {
        self.allow_direct = allow;
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.quarantine_after == 0 {
            return Err(AppError::ConfigError(
                "quarantine_after must be at least 1".into(),
            ));
        }
        if self.degrade_after > self.quarantine_after {
            return Err(AppError::ConfigError(
                "degrade_after must not exceed quarantine_after".into(),
            ));
        }
        if self.cool_down.is_zero() {
            return Err(AppError::ConfigError("Proxy cool-down must be non-zero".into()));
        }
        Ok(())
    }
}

/// A proxy handed out for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    pub id: String,
    /// Proxy URL, `None` for a direct connection.
    pub address: Option<String>,
    /// This attempt decides whether a quarantined proxy comes back.
    pub probe: bool,
}

impl ProxyLease {
    pub fn direct() -> Self {
        Self {
            id: DIRECT_PROXY_ID.to_string(),
            address: None,
            probe: false,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.address.is_none()
    }
}

#[derive(Debug)]
struct ProxyEntry {
    address: String,
    health: ProxyHealth,
    consecutive_failures: u32,
    last_used: Option<Instant>,
    last_failure: Option<Instant>,
    quarantined_since: Option<Instant>,
    probing: bool,
}

impl ProxyEntry {
    fn new(address: String) -> Self {
        Self {
            address,
            health: ProxyHealth::Healthy,
            consecutive_failures: 0,
            last_used: None,
            last_failure: None,
            quarantined_since: None,
            probing: false,
        }
    }

    fn probe_due(&self, cool_down: Duration) -> bool {
        !self.probing
            && self
                .quarantined_since
                .is_some_and(|since| since.elapsed() >= cool_down)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    proxies: Vec<ProxyEntry>,
    cursor: usize,
}

/// Health distribution of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub quarantined: usize,
}

/// Point-in-time view of one proxy, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub address: String,
    pub health: ProxyHealth,
    pub consecutive_failures: u32,
    pub since_last_used: Option<Duration>,
    pub since_last_failure: Option<Duration>,
}

/// Thread-safe proxy pool. Clones share state.
#[derive(Clone)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    inner: Arc<Mutex<PoolInner>>,
}

impl ProxyPool {
    pub fn new(addresses: Vec<String>, config: ProxyPoolConfig) -> Result<Self, AppError> {
        config.validate()?;
        let pool = Self {
            config,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        };
        pool.replace_inventory(addresses)?;
        Ok(pool)
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool mutex");
            poisoned.into_inner()
        })
    }

    /// Pick the next usable proxy, round-robin.
    ///
    /// Returns `None` when every proxy is quarantined (or probing), which the
    /// caller treats as a temporary capacity shortage.
    pub fn acquire(&self) -> Option<ProxyLease> {
        let mut inner = self.lock_inner();
        let n = inner.proxies.len();
        if n == 0 {
            return self.config.allow_direct.then(ProxyLease::direct);
        }

        let start = inner.cursor % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let entry = &mut inner.proxies[idx];
            let probe = match entry.health {
                ProxyHealth::Healthy | ProxyHealth::Degraded => false,
                ProxyHealth::Quarantined if entry.probe_due(self.config.cool_down) => true,
                ProxyHealth::Quarantined => continue,
            };
            if probe {
                entry.probing = true;
                tracing::info!(proxy = %entry.address, "Probing quarantined proxy");
            }
            entry.last_used = Some(Instant::now());
            let lease = ProxyLease {
                id: entry.address.clone(),
                address: Some(entry.address.clone()),
                probe,
            };
            inner.cursor = idx + 1;
            return Some(lease);
        }
        None
    }

    /// Feed an outcome back into the proxy's health.
    ///
    /// Never settles a probe; use [`ProxyPool::report_lease`] for outcomes
    /// of leased attempts.
    pub fn report_outcome(&self, proxy_id: &str, success: bool) {
        self.report(proxy_id, false, success);
    }

    /// Feed a leased attempt's outcome back into the proxy's health.
    ///
    /// Only the probe lease decides whether a quarantined proxy comes back;
    /// a lease handed out before the quarantine reports into the void.
    pub fn report_lease(&self, lease: &ProxyLease, success: bool) {
        self.report(&lease.id, lease.probe, success);
    }

    fn report(&self, proxy_id: &str, probe: bool, success: bool) {
        if proxy_id == DIRECT_PROXY_ID {
            return;
        }
        let mut inner = self.lock_inner();
        let Some(entry) = inner.proxies.iter_mut().find(|p| p.address == proxy_id) else {
            tracing::debug!(proxy = %proxy_id, "Outcome for proxy no longer in inventory");
            return;
        };

        if entry.health == ProxyHealth::Quarantined && !(probe && entry.probing) {
            tracing::debug!(proxy = %proxy_id, success, "Ignoring non-probe outcome for quarantined proxy");
            return;
        }
        if success {
            self.record_success(entry);
        } else {
            self.record_failure(entry);
        }
    }

    /// Hand back a lease that never carried an attempt.
    ///
    /// Only probe leases hold state; their proxy becomes probeable again.
    pub fn release_unused(&self, lease: &ProxyLease) {
        if !lease.probe {
            return;
        }
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.proxies.iter_mut().find(|p| p.address == lease.id) {
            entry.probing = false;
        }
    }

    fn record_success(&self, entry: &mut ProxyEntry) {
        match entry.health {
            ProxyHealth::Quarantined => {
                tracing::info!(proxy = %entry.address, "Proxy probe succeeded, back in rotation");
            }
            ProxyHealth::Degraded => {
                tracing::debug!(proxy = %entry.address, "Proxy healthy again");
            }
            ProxyHealth::Healthy => {}
        }
        entry.health = ProxyHealth::Healthy;
        entry.consecutive_failures = 0;
        entry.quarantined_since = None;
        entry.probing = false;
    }

    fn record_failure(&self, entry: &mut ProxyEntry) {
        let now = Instant::now();
        entry.consecutive_failures += 1;
        entry.last_failure = Some(now);

        match entry.health {
            ProxyHealth::Quarantined => {
                tracing::warn!(proxy = %entry.address, "Proxy probe failed, quarantined again");
                entry.probing = false;
                entry.quarantined_since = Some(now);
            }
            ProxyHealth::Healthy | ProxyHealth::Degraded => {
                if entry.consecutive_failures >= self.config.quarantine_after {
                    tracing::warn!(
                        proxy = %entry.address,
                        failures = entry.consecutive_failures,
                        cool_down_secs = self.config.cool_down.as_secs(),
                        "Proxy quarantined after {} consecutive failures",
                        entry.consecutive_failures
                    );
                    entry.health = ProxyHealth::Quarantined;
                    entry.quarantined_since = Some(now);
                } else if entry.consecutive_failures >= self.config.degrade_after {
                    entry.health = ProxyHealth::Degraded;
                }
            }
        }
    }

    /// Swap in a new address list, keeping the health of retained proxies.
    pub fn replace_inventory(&self, addresses: Vec<String>) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        let mut wanted = Vec::with_capacity(addresses.len());
        for raw in addresses {
            let address = raw.trim().to_string();
            if address.is_empty() || !seen.insert(address.clone()) {
                continue;
            }
            validate_proxy_address(&address)?;
            wanted.push(address);
        }

        let mut inner = self.lock_inner();
        let mut old: Vec<ProxyEntry> = std::mem::take(&mut inner.proxies);
        let before = old.len();
        let mut kept = 0usize;
        inner.proxies = wanted
            .into_iter()
            .map(|address| match old.iter().position(|e| e.address == address) {
                Some(pos) => {
                    kept += 1;
                    old.swap_remove(pos)
                }
                None => ProxyEntry::new(address),
            })
            .collect();
        if inner.cursor >= inner.proxies.len() {
            inner.cursor = 0;
        }
        tracing::info!(
            total = inner.proxies.len(),
            added = inner.proxies.len() - kept,
            removed = before - kept,
            "Proxy inventory updated"
        );
        Ok(())
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let inner = self.lock_inner();
        let mut stats = ProxyPoolStats {
            total: inner.proxies.len(),
            ..Default::default()
        };
        for entry in &inner.proxies {
            match entry.health {
                ProxyHealth::Healthy => stats.healthy += 1,
                ProxyHealth::Degraded => stats.degraded += 1,
                ProxyHealth::Quarantined => stats.quarantined += 1,
            }
        }
        stats
    }

    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        let inner = self.lock_inner();
        inner
            .proxies
            .iter()
            .map(|e| ProxySnapshot {
                address: e.address.clone(),
                health: e.health,
                consecutive_failures: e.consecutive_failures,
                since_last_used: e.last_used.map(|t| t.elapsed()),
                since_last_failure: e.last_failure.map(|t| t.elapsed()),
            })
            .collect()
    }

    pub fn health_of(&self, proxy_id: &str) -> Option<ProxyHealth> {
        let inner = self.lock_inner();
        inner
            .proxies
            .iter()
            .find(|p| p.address == proxy_id)
            .map(|p| p.health)
    }
}

fn validate_proxy_address(address: &str) -> Result<(), AppError> {
    let parsed = Url::parse(address)
        .map_err(|e| AppError::ConfigError(format!("Invalid proxy address '{address}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" | "socks5" | "socks5h" => {}
        scheme => {
            return Err(AppError::ConfigError(format!(
                "Unsupported proxy scheme '{scheme}' in {address}"
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(AppError::ConfigError(format!(
            "Proxy address '{address}' has no host"
        )));
    }
    Ok(())
}
