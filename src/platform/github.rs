// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! GitHub Actions platform client.
//!
//! Uses the repository-scoped runner endpoints: registration and removal
//! tokens are minted with POSTs, pending work is the sum of queued and
//! in-progress workflow runs.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    check_status, with_retries, ApiError, PlatformClient, RegistrationToken, RemoteRunner,
    RemoteStatus,
};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    repository: String,
    token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: Option<String>,
}

#[derive(Deserialize)]
struct RunnerList {
    #[serde(default)]
    runners: Vec<RunnerEntry>,
}

#[derive(Deserialize)]
struct RunnerEntry {
    name: String,
    status: String,
    #[serde(default)]
    busy: bool,
}

#[derive(Deserialize)]
struct WorkflowRuns {
    total_count: Option<usize>,
    #[serde(default)]
    workflow_runs: Vec<serde_json::Value>,
}

impl GithubClient {
    pub fn new(http: reqwest::Client, api_url: String, repository: String, token: String) -> Self {
        let api_url = if api_url.is_empty() {
            DEFAULT_API_URL.to_string()
        } else {
            api_url.trim_end_matches('/').to_string()
        };
        Self {
            http,
            api_url,
            repository,
            token,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_url, self.repository, path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp = self
            .http
            .get(self.endpoint(path))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp = self
            .http
            .post(self.endpoint(path))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    async fn count_runs(&self, status: &str) -> Result<usize, ApiError> {
        let runs: WorkflowRuns = self.get(&format!("actions/runs?status={status}")).await?;
        Ok(runs.total_count.unwrap_or(runs.workflow_runs.len()))
    }
}

#[async_trait]
impl PlatformClient for GithubClient {
    async fn registration_token(&self) -> Result<RegistrationToken, ApiError> {
        let resp: TokenResponse = with_retries("registration_token", || {
            self.post("actions/runners/registration-token")
        })
        .await?;
        tracing::info!(expires_at = ?resp.expires_at, "obtained registration token");
        Ok(RegistrationToken {
            token: resp.token,
            expires_at: resp.expires_at,
        })
    }

    async fn removal_token(&self) -> Result<String, ApiError> {
        let resp: TokenResponse =
            with_retries("removal_token", || self.post("actions/runners/remove-token")).await?;
        Ok(resp.token)
    }

    async fn list_runners(&self) -> Result<Vec<RemoteRunner>, ApiError> {
        let list: RunnerList = with_retries("list_runners", || self.get("actions/runners")).await?;
        Ok(list
            .runners
            .into_iter()
            .map(|r| RemoteRunner {
                status: if r.status == "online" {
                    RemoteStatus::Online
                } else {
                    RemoteStatus::Offline
                },
                name: r.name,
                busy: r.busy,
            })
            .collect())
    }

    async fn pending_work(&self) -> Result<usize, ApiError> {
        let queued = with_retries("pending_work", || self.count_runs("queued")).await?;
        let in_progress = with_retries("pending_work", || self.count_runs("in_progress")).await?;
        Ok(queued + in_progress)
    }

    fn default_labels(&self) -> Vec<String> {
        vec!["self-hosted".to_string(), "linux".to_string()]
    }

    fn registration_url(&self) -> String {
        format!("https://github.com/{}", self.repository)
    }

    fn name(&self) -> &'static str {
        "github"
    }
}
