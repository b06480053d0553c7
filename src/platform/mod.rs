// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed clients for the remote CI platforms.
//!
//! Every platform exposes the same narrow contract: mint registration and
//! removal credentials, list registered runners, and report how much work
//! is waiting. Errors are classified into transient (retried with bounded
//! backoff) and permanent (surfaced to the caller) at the HTTP layer, so
//! call sites only decide whether to skip a tick or halt an operation.

mod gitea;
mod github;
mod gitlab;

pub use gitea::GiteaClient;
pub use github::GithubClient;
pub use gitlab::GitlabClient;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::{Config, PlatformKind};

/// Maximum attempts for a transiently failing API call.
const MAX_ATTEMPTS: u32 = 3;
/// Initial backoff delay, doubled per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub const USER_AGENT: &str = concat!("runnerd/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ApiError {
    /// Timeouts, connection resets, 5xx, and 429. Retried with backoff.
    #[error("transient network failure: {message}")]
    Transient {
        message: String,
        /// Server-provided delay from a 429 response, if any.
        retry_after: Option<Duration>,
    },

    /// 4xx (other than 429) and malformed responses. Not retried.
    #[error("permanent API failure: {0}")]
    Permanent(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    fn transient(message: impl Into<String>) -> Self {
        ApiError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            ApiError::Permanent(format!("malformed response: {err}"))
        } else {
            // Timeouts, connect failures, and mid-body resets.
            ApiError::transient(err.to_string())
        }
    }
}

/// Whether a remote runner is reachable from the platform's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Online,
    Offline,
}

/// One entry of the platform's runner inventory.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteRunner {
    pub name: String,
    pub status: RemoteStatus,
    pub busy: bool,
}

/// A one-shot credential for attaching a worker to the project.
#[derive(Debug, Clone)]
pub struct RegistrationToken {
    pub token: String,
    /// Expiry timestamp as reported by the platform, when it reports one.
    pub expires_at: Option<String>,
}

/// The uniform platform contract.
///
/// Tokens obtained here are handed straight to the vendor scripts and never
/// stored; the client itself authenticates every request with the single
/// configured bearer token.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Mint a short-lived registration credential.
    async fn registration_token(&self) -> Result<RegistrationToken, ApiError>;

    /// Mint a credential valid for one deregistration.
    async fn removal_token(&self) -> Result<String, ApiError>;

    /// Current runner inventory for the configured scope.
    async fn list_runners(&self) -> Result<Vec<RemoteRunner>, ApiError>;

    /// Queued plus in-progress work items the scope could dispatch.
    async fn pending_work(&self) -> Result<usize, ApiError>;

    /// Platform-mandated base labels.
    fn default_labels(&self) -> Vec<String>;

    /// URL handed to the vendor configuration script as `--url`.
    fn registration_url(&self) -> String;

    fn name(&self) -> &'static str;
}

/// Construct the configured platform client.
pub fn create(config: &Config) -> Result<Arc<dyn PlatformClient>, ApiError> {
    let client = build_http(config.api_timeout)?;
    Ok(match config.platform {
        PlatformKind::Github => Arc::new(GithubClient::new(
            client,
            config.api_url.clone(),
            config.repository.clone(),
            config.token.clone(),
        )),
        PlatformKind::Gitlab => Arc::new(GitlabClient::new(
            client,
            config.api_url.clone(),
            config.project_id.clone(),
            config.token.clone(),
        )),
        PlatformKind::Gitea => Arc::new(GiteaClient::new(
            client,
            config.api_url.clone(),
            config.repository.clone(),
            config.token.clone(),
        )),
    })
}

/// Build the shared HTTP client with the bounded request timeout.
pub fn build_http(timeout: Duration) -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ApiError::Permanent(format!("http client: {e}")))
}

/// Classify a non-success HTTP response into the error taxonomy.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ApiError::Transient {
            message: format!("rate limited ({status})"),
            retry_after,
        });
    }
    if status.is_server_error() {
        return Err(ApiError::transient(format!("server error ({status})")));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Permanent(format!("{status}: {body}")))
}

/// Run `call` with bounded exponential backoff on transient failures.
pub(crate) async fn with_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut delay = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                let wait = match &err {
                    ApiError::Transient {
                        retry_after: Some(after),
                        ..
                    } => *after,
                    _ => delay,
                };
                tracing::warn!(
                    operation,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "transient API failure, retrying"
                );
                tokio::time::sleep(wait).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_stop_after_three_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::transient("boom")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ApiError> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Permanent("bad request".into())) }
        })
        .await;
        assert!(matches!(result, Err(ApiError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_then_success_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ApiError::transient("flaky"))
                } else {
                    Ok(7usize)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
