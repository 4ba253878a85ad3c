use std::collections::{HashMap, HashSet};
use std::error::Error as _;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use ferry_core::error::AppError;
use ferry_core::proxy::ProxyLease;
use ferry_core::traits::{AttemptOutcome, FetchExecutor, TransportErrorKind};
use reqwest::{Client, Proxy};
use url::Url;

const DEFAULT_USER_AGENT: &str = "Ferry/0.1";
const DEFAULT_TOKEN_HEADER: &str = "X-Captcha-Token";
const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// HTTP executor using reqwest.
///
/// Keeps one `Client` per proxy address so connection pools are reused
/// across attempts through the same egress. Clients for proxies that left the
/// inventory are dropped by [`retain_proxies`](Self::retain_proxies). A solved
/// CAPTCHA token is sent in a configurable header.
///
/// Bodies larger than `max_body_bytes` (10 MiB by default) are cut off and the
/// attempt is reported as a transport failure.
///
/// SSRF protection is **enabled** by default: requests to private/reserved
/// IP ranges come back as [`TransportErrorKind::InvalidUrl`]. Use
/// [`allow_private_urls`](Self::allow_private_urls) to disable it.
#[derive(Clone)]
pub struct ReqwestExecutor {
    clients: Arc<Mutex<HashMap<String, Client>>>,
    timeout: Duration,
    user_agent: String,
    token_header: String,
    max_body_bytes: usize,
    ssrf_protection: bool,
}

impl ReqwestExecutor {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let executor = Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            ssrf_protection: true,
        };
        // Fail early on a broken TLS backend rather than on the first attempt.
        executor.client_for(&ProxyLease::direct())?;
        Ok(executor)
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self.clients = Arc::new(Mutex::new(HashMap::new()));
        self
    }

    /// Header that carries a solved CAPTCHA token.
    pub fn with_token_header(mut self, header: impl Into<String>) -> Self {
        self.token_header = header.into();
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Drop cached clients for proxies not in `addresses`. The direct client
    /// is always kept.
    pub fn retain_proxies<'a>(&self, addresses: impl IntoIterator<Item = &'a str>) {
        let keep: HashSet<&str> = addresses.into_iter().collect();
        self.lock_clients()
            .retain(|key, _| key.is_empty() || keep.contains(key.as_str()));
    }

    /// Number of cached clients, the direct one included.
    pub fn cached_clients(&self) -> usize {
        self.lock_clients().len()
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn client_for(&self, lease: &ProxyLease) -> Result<Client, AppError> {
        let key = lease.address.clone().unwrap_or_default();
        if let Some(client) = self.lock_clients().get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout);
        if let Some(address) = &lease.address {
            let proxy = Proxy::all(address)
                .map_err(|e| AppError::ConfigError(format!("Invalid proxy {address}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        self.lock_clients().insert(key, client.clone());
        Ok(client)
    }

    fn transport_error(&self, e: &reqwest::Error, lease: &ProxyLease) -> TransportErrorKind {
        if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if is_connection_reset(e) {
            TransportErrorKind::ConnectionReset
        } else if e.is_connect() && !lease.is_direct() {
            TransportErrorKind::Proxy
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else if e.is_builder() {
            TransportErrorKind::InvalidUrl
        } else {
            TransportErrorKind::Other
        }
    }
}

fn is_connection_reset(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        source = err.source();
    }
    false
}

impl FetchExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        url: &str,
        proxy: &ProxyLease,
        captcha_token: Option<&str>,
    ) -> AttemptOutcome {
        let started = Instant::now();
        let fail = |kind: TransportErrorKind, message: String| AttemptOutcome::Transport {
            kind,
            message,
            elapsed: started.elapsed(),
        };

        if self.ssrf_protection
            && let Err(e) = validate_url(url).await
        {
            let kind = match e {
                AppError::ConfigError(_) => TransportErrorKind::InvalidUrl,
                _ => TransportErrorKind::Connect,
            };
            return fail(kind, e.to_string());
        }

        let client = match self.client_for(proxy) {
            Ok(client) => client,
            Err(e) => return fail(TransportErrorKind::Proxy, e.to_string()),
        };

        let mut request = client.get(url);
        if let Some(token) = captcha_token {
            request = request.header(self.token_header.as_str(), token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return fail(self.transport_error(&e, proxy), e.to_string()),
        };

        let status = response.status().as_u16();
        match self.read_body(response).await {
            Ok(body) => AttemptOutcome::Response {
                status,
                body,
                elapsed: started.elapsed(),
            },
            Err(BodyError::TooLarge) => fail(
                TransportErrorKind::Other,
                format!("Response body exceeds {} bytes", self.max_body_bytes),
            ),
            Err(BodyError::Read(e)) => fail(
                self.transport_error(&e, proxy),
                format!("Failed to read response body: {e}"),
            ),
        }
    }
}

enum BodyError {
    TooLarge,
    Read(reqwest::Error),
}

impl ReqwestExecutor {
    async fn read_body(&self, mut response: reqwest::Response) -> Result<String, BodyError> {
        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(BodyError::TooLarge);
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(BodyError::Read)? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(BodyError::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
///
/// Rejections are `ConfigError`; resolver failures are `TransientNetwork`.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::ConfigError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::ConfigError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::ConfigError("URL has no host".to_string()))?;

    // IP literals are checked directly. `host_str` keeps IPv6 brackets.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::ConfigError(format!(
                "SSRF blocked: {host} is a private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::TransientNetwork(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::TransientNetwork(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::ConfigError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}
