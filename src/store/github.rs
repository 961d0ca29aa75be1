//! GitHub REST backend for [`ObjectStore`].
//!
//! Every call is a single authenticated request against the git data API.
//! The authenticated login is resolved once in [`GitHubStore::connect`] and
//! frozen into an immutable [`Session`].

use std::collections::BTreeSet;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::config::UpstreamConfig;
use crate::error::StoreError;
use crate::metrics::{Endpoint, MetricsRegistry};
use crate::model::{CommitInfo, LabelSpec, RepoInfo, RepositoryConfig, TreeEntry};

use super::rate_limit::{RateLimitSnapshot, RateLimitState};
use super::{check_blob_size, ObjectStore, StoreResult};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Identity established when the store connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Login of the token owner; every repository is created under it.
    pub owner: String,
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    name: String,
    full_name: String,
    html_url: String,
    #[serde(default = "default_branch_name")]
    default_branch: String,
}

fn default_branch_name() -> String {
    "main".to_string()
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    #[serde(default)]
    html_url: String,
    tree: ShaResponse,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaResponse,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

// ---------------------------------------------------------------------------
// Store struct
// ---------------------------------------------------------------------------

pub struct GitHubStore {
    http: reqwest::Client,
    api_url: String,
    session: Session,
    rate_limit: RateLimitState,
    max_blob_bytes: u64,
    metrics: MetricsRegistry,
}

impl GitHubStore {
    /// Build the HTTP client and resolve the token owner via `GET /user`.
    #[instrument(skip_all, fields(api_url = %config.api_url))]
    pub async fn connect(
        config: &UpstreamConfig,
        token: &str,
        max_blob_bytes: u64,
        metrics: MetricsRegistry,
    ) -> StoreResult<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| StoreError::transport("token contains invalid header characters"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_str(&config.api_version)
                .map_err(|_| StoreError::transport("invalid api_version header value"))?,
        );

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StoreError::transport(format!("failed to build HTTP client: {e}")))?;

        let mut store = Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            session: Session {
                owner: String::new(),
            },
            rate_limit: RateLimitState::new(),
            max_blob_bytes,
            metrics,
        };

        let user: UserResponse = store
            .fetch(Endpoint::User, store.http.get(format!("{}/user", store.api_url)))
            .await?;
        debug!(owner = %user.login, "authenticated");
        store.session = Session { owner: user.login };
        Ok(store)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn repo_url(&self, repo: &str) -> String {
        format!("{}/repos/{}/{repo}", self.api_url, self.session.owner)
    }

    fn git_url(&self, repo: &str, tail: &str) -> String {
        format!("{}/git/{tail}", self.repo_url(repo))
    }

    /// Send a request, record rate-limit headers and metrics, and turn any
    /// non-2xx status into [`StoreError::Remote`].
    async fn send(&self, endpoint: Endpoint, request: RequestBuilder) -> StoreResult<Response> {
        let result = request.send().await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.metrics.metrics.record_call(endpoint, false);
                return Err(StoreError::transport(e.to_string()));
            }
        };

        self.rate_limit.update_from_headers(resp.headers());
        if let Some(remaining) = self.rate_limit.snapshot().remaining {
            self.metrics
                .metrics
                .rate_limit_remaining
                .set(i64::try_from(remaining).unwrap_or(i64::MAX));
        }

        let status = resp.status();
        self.metrics.metrics.record_call(endpoint, status.is_success());
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            });
        warn!(%status, %message, "upstream API returned non-success");
        Err(StoreError::remote(status.as_u16(), message))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        request: RequestBuilder,
    ) -> StoreResult<T> {
        let resp = self.send(endpoint, request).await?;
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::transport(format!("failed to parse API response: {e}")))
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http.request(method, url)
    }
}

/// `true` when `err` is a remote response with one of `statuses`.
fn has_status(err: &StoreError, statuses: &[StatusCode]) -> bool {
    err.status()
        .is_some_and(|s| statuses.iter().any(|c| c.as_u16() == s))
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ObjectStore for GitHubStore {
    async fn repository_exists(&self, name: &str) -> StoreResult<bool> {
        let request = self.request(Method::GET, self.repo_url(name));
        match self.send(Endpoint::Repos, request).await {
            Ok(_) => Ok(true),
            Err(e) if has_status(&e, &[StatusCode::NOT_FOUND]) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip_all, fields(repo = %config.name))]
    async fn create_repository(&self, config: &RepositoryConfig) -> StoreResult<RepoInfo> {
        let mut payload = json!({
            "name": config.name,
            "description": config.description,
            "private": config.visibility.is_private(),
            "has_issues": config.has_issues,
            "has_wiki": config.has_wiki,
            "has_projects": config.has_projects,
            "auto_init": true,
        });
        if let Some(homepage) = &config.homepage {
            payload["homepage"] = json!(homepage);
        }

        let request = self
            .request(Method::POST, format!("{}/user/repos", self.api_url))
            .json(&payload);
        let repo: RepoResponse = self.fetch(Endpoint::Repos, request).await?;
        Ok(RepoInfo {
            name: repo.name,
            full_name: repo.full_name,
            html_url: repo.html_url,
            default_branch: repo.default_branch,
        })
    }

    async fn set_topics(&self, repo: &str, topics: &BTreeSet<String>) -> StoreResult<()> {
        let request = self
            .request(Method::PUT, format!("{}/topics", self.repo_url(repo)))
            .json(&json!({ "names": topics }));
        self.send(Endpoint::Topics, request).await?;
        Ok(())
    }

    async fn create_label(&self, repo: &str, label: &LabelSpec) -> StoreResult<()> {
        let request = self
            .request(Method::POST, format!("{}/labels", self.repo_url(repo)))
            .json(label);
        self.send(Endpoint::Labels, request).await?;
        Ok(())
    }

    async fn default_branch_head(&self, repo: &str, branch: &str) -> StoreResult<Option<String>> {
        let request = self.request(
            Method::GET,
            self.git_url(repo, &format!("refs/heads/{branch}")),
        );
        match self.fetch::<RefResponse>(Endpoint::Refs, request).await {
            Ok(r) => Ok(Some(r.object.sha)),
            // 409 is returned while the repository has no commits at all.
            Err(e) if has_status(&e, &[StatusCode::NOT_FOUND, StatusCode::CONFLICT]) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn commit_tree(&self, repo: &str, commit: &str) -> StoreResult<String> {
        let request = self.request(Method::GET, self.git_url(repo, &format!("commits/{commit}")));
        let commit: CommitResponse = self.fetch(Endpoint::Commits, request).await?;
        Ok(commit.tree.sha)
    }

    async fn create_blob(&self, repo: &str, content: &[u8]) -> StoreResult<String> {
        check_blob_size(content, self.max_blob_bytes())?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let request = self
            .request(Method::POST, self.git_url(repo, "blobs"))
            .json(&json!({ "content": encoded, "encoding": "base64" }));
        let blob: ShaResponse = self.fetch(Endpoint::Blobs, request).await?;
        Ok(blob.sha)
    }

    #[instrument(skip_all, fields(repo = %repo, entries = entries.len()))]
    async fn create_tree(
        &self,
        repo: &str,
        entries: &[TreeEntry],
        base_tree: Option<&str>,
    ) -> StoreResult<String> {
        let tree: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "path": e.path,
                    "mode": e.mode.as_git_mode(),
                    "type": e.object_type.as_str(),
                    "sha": e.remote_id,
                })
            })
            .collect();
        let mut payload = json!({ "tree": tree });
        if let Some(base) = base_tree {
            payload["base_tree"] = json!(base);
        }

        let request = self
            .request(Method::POST, self.git_url(repo, "trees"))
            .json(&payload);
        let tree: ShaResponse = self.fetch(Endpoint::Trees, request).await?;
        Ok(tree.sha)
    }

    async fn create_commit(
        &self,
        repo: &str,
        message: &str,
        tree: &str,
        parent: Option<&str>,
    ) -> StoreResult<CommitInfo> {
        let parents: Vec<&str> = parent.into_iter().collect();
        let request = self
            .request(Method::POST, self.git_url(repo, "commits"))
            .json(&json!({ "message": message, "tree": tree, "parents": parents }));
        let commit: CommitResponse = self.fetch(Endpoint::Commits, request).await?;
        Ok(CommitInfo {
            sha: commit.sha,
            html_url: commit.html_url,
        })
    }

    async fn update_ref(
        &self,
        repo: &str,
        ref_name: &str,
        commit: &str,
        force: bool,
    ) -> StoreResult<()> {
        let request = self
            .request(Method::PATCH, self.git_url(repo, &format!("refs/{ref_name}")))
            .json(&json!({ "sha": commit, "force": force }));
        self.send(Endpoint::Refs, request).await?;
        Ok(())
    }

    async fn create_ref(&self, repo: &str, ref_name: &str, commit: &str) -> StoreResult<()> {
        let request = self
            .request(Method::POST, self.git_url(repo, "refs"))
            .json(&json!({ "ref": format!("refs/{ref_name}"), "sha": commit }));
        self.send(Endpoint::Refs, request).await?;
        Ok(())
    }

    fn max_blob_bytes(&self) -> u64 {
        self.max_blob_bytes
    }

    fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        Some(self.rate_limit.snapshot())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
