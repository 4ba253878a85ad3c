use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::captcha::Challenge;
use crate::error::AppError;
use crate::proxy::ProxyLease;

/// Why a network attempt produced no HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionReset,
    Connect,
    /// The proxy itself refused or broke the tunnel.
    Proxy,
    /// The URL cannot be fetched at all (bad scheme, blocked address).
    InvalidUrl,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionReset => "connection reset",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Proxy => "proxy",
            TransportErrorKind::InvalidUrl => "invalid url",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{s}")
    }
}

/// Raw result of one network attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Response {
        status: u16,
        body: String,
        elapsed: Duration,
    },
    Transport {
        kind: TransportErrorKind,
        message: String,
        elapsed: Duration,
    },
}

impl AttemptOutcome {
    pub fn response(status: u16, body: impl Into<String>) -> Self {
        AttemptOutcome::Response {
            status,
            body: body.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        AttemptOutcome::Transport {
            kind,
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptOutcome::Response { status, .. } => Some(*status),
            AttemptOutcome::Transport { .. } => None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            AttemptOutcome::Response { elapsed, .. } | AttemptOutcome::Transport { elapsed, .. } => {
                *elapsed
            }
        }
    }

    /// Whether the proxy carrying this attempt should be considered healthy.
    ///
    /// Transport failures, 407, 429 and CAPTCHA walls point at the egress IP;
    /// any other HTTP answer means the proxy did its job.
    pub fn proxy_healthy(&self, challenged: bool) -> bool {
        match self {
            AttemptOutcome::Transport { kind, .. } => *kind == TransportErrorKind::InvalidUrl,
            AttemptOutcome::Response { status, .. } => {
                !challenged && *status != 407 && *status != 429
            }
        }
    }

    /// Convert a failed outcome to the error taxonomy.
    pub fn to_error(&self) -> Option<AppError> {
        match self {
            AttemptOutcome::Transport { kind, message, elapsed } => Some(match kind {
                TransportErrorKind::Timeout => AppError::Timeout(elapsed.as_millis() as u64),
                TransportErrorKind::InvalidUrl => AppError::ConfigError(message.clone()),
                _ => AppError::TransientNetwork(format!("{kind}: {message}")),
            }),
            AttemptOutcome::Response { status, .. } if (200..300).contains(status) => None,
            AttemptOutcome::Response { status, .. } if *status >= 500 => Some(
                AppError::TransientNetwork(format!("Upstream returned HTTP {status}")),
            ),
            AttemptOutcome::Response { status, .. } => Some(AppError::TargetRejection {
                status: *status,
                message: format!("Target returned HTTP {status}"),
            }),
        }
    }
}

/// Performs one fetch through the given proxy.
///
/// Implementations carry no policy: no retries, no classification. They must
/// honour their own hard timeout and report it as
/// [`TransportErrorKind::Timeout`].
pub trait FetchExecutor: Send + Sync + Clone {
    fn execute(
        &self,
        url: &str,
        proxy: &ProxyLease,
        captcha_token: Option<&str>,
    ) -> impl Future<Output = AttemptOutcome> + Send;
}

/// External CAPTCHA solving service.
pub trait CaptchaSolver: Send + Sync + Clone {
    /// Solve the challenge, returning the token to present on the next attempt.
    fn solve(&self, challenge: &Challenge) -> impl Future<Output = Result<String, AppError>> + Send;
}
