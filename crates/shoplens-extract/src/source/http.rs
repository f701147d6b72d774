//! Retrying JSON client shared by the HTTP source adapters
//!
//! Up to `max_retries` attempts per request with exponential backoff, a
//! bearer token on every call, and a running count of network calls.

use crate::config::HttpConfig;
use crate::error::{ExtractError, SourceError};
use crate::source::auth::TokenProvider;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Backoff after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!("{} attempt {}/{} failed: {}", operation, attempt, policy.max_attempts, e);
                let backoff = policy.backoff(attempt);
                info!("Retrying in {:?}...", backoff);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}

/// Authenticated JSON client with retries and a call counter
pub struct ApiClient {
    http: Client,
    tokens: TokenProvider,
    retry: RetryPolicy,
    calls: AtomicU64,
}

impl ApiClient {
    pub fn new(http: Client, tokens: TokenProvider, retry: RetryPolicy) -> Self {
        Self {
            http,
            tokens,
            retry,
            calls: AtomicU64::new(0),
        }
    }

    /// Build the underlying reqwest client from configuration
    pub fn build_http(config: &HttpConfig) -> Result<Client, ExtractError> {
        config.validate().map_err(ExtractError::Setup)?;
        Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("shoplens-extract/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExtractError::setup(format!("Failed to build HTTP client: {}", e)))
    }

    /// Network calls issued so far, retries included
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Send the request built by `build` and decode a JSON body
    pub async fn json<T, F>(&self, operation: &str, build: F) -> Result<T, SourceError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let this = self;
        let build = &build;
        with_retry(&self.retry, operation, move || async move {
            let response = this.send_once(build).await?;
            response
                .json::<T>()
                .await
                .map_err(|e| SourceError::Decode(format!("{}: {}", operation, e)))
        })
        .await
    }

    /// `true` on a success status, `false` on 404
    pub async fn exists<F>(&self, operation: &str, build: F) -> Result<bool, SourceError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let this = self;
        let build = &build;
        let outcome = with_retry(&self.retry, operation, move || async move {
            this.send_once(build).await.map(|_| ())
        })
        .await;

        match outcome {
            Ok(()) => Ok(true),
            Err(SourceError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    async fn send_once<F>(&self, build: &F) -> Result<Response, SourceError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.bearer().await?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        let response = build(&self.http).bearer_auth(token).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(SourceError::Status {
            status: status.as_u16(),
            body: truncate(&body, 500),
        })
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
