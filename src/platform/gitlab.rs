// Copyright 2024-2026 Runnerd Contributors
// SPDX-License-Identifier: Apache-2.0

//! GitLab platform client (gitlab.com and self-hosted instances).
//!
//! GitLab's credential model differs from GitHub's: runners register with a
//! pre-generated instance/project token, so `registration_token` and
//! `removal_token` return the configured token unchanged instead of minting
//! short-lived ones.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    check_status, with_retries, ApiError, PlatformClient, RegistrationToken, RemoteRunner,
    RemoteStatus,
};

pub const DEFAULT_API_URL: &str = "https://gitlab.com";

pub struct GitlabClient {
    http: reqwest::Client,
    api_url: String,
    project_id: String,
    token: String,
}

#[derive(Deserialize)]
struct RunnerEntry {
    description: Option<String>,
    #[serde(default)]
    online: Option<bool>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct JobEntry {
    #[allow(dead_code)]
    id: u64,
}

impl GitlabClient {
    pub fn new(http: reqwest::Client, api_url: String, project_id: String, token: String) -> Self {
        let api_url = if api_url.is_empty() {
            DEFAULT_API_URL.to_string()
        } else {
            api_url.trim_end_matches('/').to_string()
        };
        Self {
            http,
            api_url,
            project_id,
            token,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}/api/v4/{path}", self.api_url);
        let resp = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

#[async_trait]
impl PlatformClient for GitlabClient {
    async fn registration_token(&self) -> Result<RegistrationToken, ApiError> {
        // Pre-generated token model: the configured token is the credential.
        Ok(RegistrationToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }

    async fn removal_token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }

    async fn list_runners(&self) -> Result<Vec<RemoteRunner>, ApiError> {
        let path = format!("projects/{}/runners", self.project_id);
        let entries: Vec<RunnerEntry> = with_retries("list_runners", || self.get(&path)).await?;
        Ok(entries
            .into_iter()
            .map(|r| {
                let online = r
                    .online
                    .unwrap_or_else(|| r.status.as_deref() == Some("online"));
                RemoteRunner {
                    name: r.description.unwrap_or_default(),
                    status: if online {
                        RemoteStatus::Online
                    } else {
                        RemoteStatus::Offline
                    },
                    // GitLab's runner listing does not expose a busy flag at
                    // this endpoint; running jobs are counted separately.
                    busy: false,
                }
            })
            .collect())
    }

    async fn pending_work(&self) -> Result<usize, ApiError> {
        let path = format!(
            "projects/{}/jobs?scope[]=pending&scope[]=running",
            self.project_id
        );
        let jobs: Vec<JobEntry> = with_retries("pending_work", || self.get(&path)).await?;
        Ok(jobs.len())
    }

    fn default_labels(&self) -> Vec<String> {
        vec!["docker".to_string(), "linux".to_string()]
    }

    fn registration_url(&self) -> String {
        self.api_url.clone()
    }

    fn name(&self) -> &'static str {
        "gitlab"
    }
}
