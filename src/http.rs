//! Shared JSON-over-HTTP call with retry.
//!
//! Used by the embedding, vector-store, and generation clients. The retry
//! policy is:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and client timeouts → retry
//! - Backoff doubles from `base_backoff` on each attempt
//!
//! Callers that already have a fallback strategy pass `max_retries = 0`.

use anyhow::{anyhow, bail, Result};
use reqwest::{Method, RequestBuilder};
use std::time::Duration;

/// How to retry a request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        base_backoff: Duration::from_millis(0),
    };

    fn delay(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt - 1).min(5))
    }
}

/// Send a JSON request and decode the JSON response.
///
/// `build` is called once per attempt because a `RequestBuilder` is
/// consumed by `send`. `label` prefixes error messages.
pub async fn send_json<F>(label: &str, policy: RetryPolicy, build: F) -> Result<serde_json::Value>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            tokio::time::sleep(policy.delay(attempt)).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // 429 or 5xx: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow!("{} error {}: {}", label, status, body_text));
                    continue;
                }

                // Other 4xx: fail now
                let body_text = response.text().await.unwrap_or_default();
                bail!("{} error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} request failed: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", label)))
}

/// Build a request with a JSON body and an optional bearer token.
pub fn json_request(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> RequestBuilder {
    let mut req = client
        .request(method, url)
        .header("Content-Type", "application/json")
        .json(body);
    if let Some(token) = bearer {
        req = req.header("Authorization", format!("Bearer {}", token));
    }
    req
}

/// Read an API key from the environment variable `var`.
pub fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| anyhow!("{} environment variable not set", var))
}
