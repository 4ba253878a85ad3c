use std::time::Duration;

use ferry_core::captcha::Challenge;
use ferry_core::error::AppError;
use ferry_core::traits::CaptchaSolver;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_SOLVER_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for an HTTP CAPTCHA-solving service.
///
/// Posts the challenge as JSON to the configured endpoint and expects
/// `{"token": "..."}` back. Errors may come back as `{"error": "..."}`.
#[derive(Clone)]
pub struct HttpCaptchaSolver {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpCaptchaSolver {
    pub fn new(endpoint: &str, api_key: Option<&str>) -> Result<Self, AppError> {
        Self::build(endpoint, api_key, DEFAULT_SOLVER_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        Self::build(&self.endpoint, self.api_key.as_deref(), timeout)
    }

    fn build(endpoint: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, AppError> {
        url::Url::parse(endpoint)
            .map_err(|e| AppError::ConfigError(format!("Invalid solver endpoint: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.map(str::to_string),
            timeout_secs: timeout.as_secs(),
        })
    }
}

// ---- Solver API types ----

#[derive(Serialize)]
struct SolveRequest<'a> {
    url: &'a str,
    kind: ferry_core::captcha::ChallengeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    site_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

#[derive(Deserialize)]
struct SolveResponse {
    token: Option<String>,
    error: Option<String>,
}

impl CaptchaSolver for HttpCaptchaSolver {
    async fn solve(&self, challenge: &Challenge) -> Result<String, AppError> {
        let request = SolveRequest {
            url: &challenge.url,
            kind: challenge.kind,
            site_key: challenge.site_key.as_deref(),
            status: challenge.status,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs * 1000)
            } else {
                AppError::CaptchaSolver(format!("Request failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::CaptchaSolver(format!("Failed to read response: {e}")))?;
        let parsed = serde_json::from_str::<SolveResponse>(&body);

        if !status.is_success() {
            let message = parsed
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("HTTP {}: {}", status.as_u16(), body));
            return Err(AppError::CaptchaSolver(message));
        }

        match parsed {
            Ok(SolveResponse {
                token: Some(token), ..
            }) if !token.is_empty() => {
                tracing::debug!(url = %challenge.url, "Solver returned a token");
                Ok(token)
            }
            Ok(SolveResponse { error: Some(e), .. }) => Err(AppError::CaptchaSolver(e)),
            Ok(_) => Err(AppError::CaptchaSolver("Response carried no token".into())),
            Err(e) => Err(AppError::CaptchaSolver(format!(
                "Failed to parse solver response: {e}"
            ))),
        }
    }
}
