//! Gitea Actions platform client.
//!
//! Gitea mirrors GitHub's registration-token flow; removal reuses the
//! configured token because Gitea has no dedicated remove-token endpoint.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    check_status, with_retries, ApiError, PlatformClient, RegistrationToken, RemoteRunner,
    RemoteStatus,
};

pub struct GiteaClient {
    http: reqwest::Client,
    api_url: String,
    repository: String,
    token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Deserialize)]
struct RunnerEntry {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    busy: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RunnerListing {
    Wrapped {
        #[serde(default)]
        runners: Vec<RunnerEntry>,
    },
    Bare(Vec<RunnerEntry>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RunListing {
    Wrapped {
        #[serde(default)]
        workflow_runs: Vec<serde_json::Value>,
    },
    Bare(Vec<serde_json::Value>),
}

impl GiteaClient {
    pub fn new(http: reqwest::Client, api_url: String, repository: String, token: String) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            repository,
            token,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/repos/{}/{}", self.api_url, self.repository, path)
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<T, ApiError> {
        let resp = self
            .http
            .request(method, self.endpoint(path))
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

#[async_trait]
impl PlatformClient for GiteaClient {
    async fn registration_token(&self) -> Result<RegistrationToken, ApiError> {
        let resp: TokenResponse = with_retries("registration_token", || {
            self.request(reqwest::Method::POST, "actions/runners/registration-token")
        })
        .await?;
        Ok(RegistrationToken {
            token: resp.token,
            expires_at: None,
        })
    }

    async fn removal_token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }

    async fn list_runners(&self) -> Result<Vec<RemoteRunner>, ApiError> {
        let listing: RunnerListing = with_retries("list_runners", || {
            self.request(reqwest::Method::GET, "actions/runners")
        })
        .await?;
        let entries = match listing {
            RunnerListing::Wrapped { runners } => runners,
            RunnerListing::Bare(runners) => runners,
        };
        Ok(entries
            .into_iter()
            .map(|r| RemoteRunner {
                status: if r.status.as_deref() == Some("online") {
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
        let listing: RunListing = with_retries("pending_work", || {
            self.request(reqwest::Method::GET, "actions/runs?status=pending")
        })
        .await?;
        Ok(match listing {
            RunListing::Wrapped { workflow_runs } => workflow_runs.len(),
            RunListing::Bare(runs) => runs.len(),
        })
    }

    fn default_labels(&self) -> Vec<String> {
        vec!["self-hosted".to_string(), "linux".to_string()]
    }

    fn registration_url(&self) -> String {
        format!("{}/{}", self.api_url, self.repository)
    }

    fn name(&self) -> &'static str {
        "gitea"
    }
}
