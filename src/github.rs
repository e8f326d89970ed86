//! GitHub REST API integration
//!
//! Everything the triage reads from or appends to GitHub goes through the
//! [`CiBackend`] trait: workflow run metadata, jobs and their logs, the git
//! data API (blobs, trees, commits, refs), pull requests and issue comments.
//! [`GithubClient`] is the HTTP implementation; tests use an in-memory fake.

use crate::util::sanitize_error_body;
use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::Repository;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

const API_TIMEOUT_SECS: u64 = 60;
/// Log archives can be large and are served from a slower blob store
const LOG_TIMEOUT_SECS: u64 = 300;
const JOBS_PER_PAGE: usize = 100;
/// GitHub caps a run at a few hundred jobs; never page past this.
const MAX_JOB_PAGES: usize = 10;

/// Mode used for files that do not exist in the base tree yet
pub const DEFAULT_FILE_MODE: &str = "100644";

/// Tree mode git uses for symbolic links
pub const SYMLINK_MODE: &str = "120000";

// ============================================================================
// Run and job metadata
// ============================================================================

/// Workflow run metadata, as returned by `GET /actions/runs/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    pub head_sha: String,
    #[serde(default)]
    pub event: String,
    /// Workflow file path, e.g. `.github/workflows/ci.yml`
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub pull_requests: Vec<RunPullRequest>,
}

impl RunInfo {
    /// The pull request this run was triggered for, if any.
    pub fn pull_request(&self) -> Option<&RunPullRequest> {
        self.pull_requests.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPullRequest {
    pub number: u64,
    pub head: BranchRef,
    pub base: BranchRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub steps: Vec<JobStep>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobStep {
    pub name: String,
    #[serde(default)]
    pub number: u64,
    #[serde(default)]
    pub conclusion: Option<String>,
}

impl Job {
    pub fn is_failed(&self) -> bool {
        self.conclusion.as_deref() == Some("failure")
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|step| step.conclusion.as_deref() == Some("failure"))
            .map(|step| step.name.as_str())
            .collect()
    }
}

#[derive(Deserialize)]
struct JobsPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    jobs: Vec<Job>,
}

// ============================================================================
// Git data
// ============================================================================

/// One entry of an existing tree
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sha: Option<String>,
}

/// A blob to layer over a base tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewTreeEntry {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sha: String,
}

impl NewTreeEntry {
    pub fn blob(path: impl Into<String>, mode: impl Into<String>, sha: impl Into<String>) -> Self {
        NewTreeEntry {
            path: path.into(),
            mode: mode.into(),
            kind: "blob",
            sha: sha.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    tree: ShaResponse,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

impl TreeResponse {
    fn into_entries(self, tree_sha: &str) -> Vec<TreeEntry> {
        if self.truncated {
            warn!(
                tree_sha,
                listed = self.tree.len(),
                "tree listing truncated; missing entries use the default mode"
            );
        }
        self.tree
    }
}

#[derive(Deserialize)]
struct RepoResponse {
    default_branch: String,
}

#[derive(Deserialize)]
struct CreatePrResponse {
    html_url: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

// ============================================================================
// Backend trait
// ============================================================================

/// The CI and version-control operations the triage depends on.
///
/// Write operations only ever append (blobs, trees, commits, a new ref, a
/// new pull request, a new comment); nothing here rewrites existing refs.
#[async_trait]
pub trait CiBackend: Send + Sync {
    async fn run_info(&self, run_id: u64) -> Result<RunInfo>;

    /// All jobs of a run, across every page.
    async fn list_jobs(&self, run_id: u64) -> Result<Vec<Job>>;

    /// Plain-text log of one job.
    async fn job_logs(&self, job_id: u64) -> Result<String>;

    /// SHA of the tree a commit points at.
    async fn commit_tree(&self, commit_sha: &str) -> Result<String>;

    /// Recursive listing of a tree.
    async fn tree_entries(&self, tree_sha: &str) -> Result<Vec<TreeEntry>>;

    async fn create_blob(&self, content: &str) -> Result<String>;

    async fn create_tree(&self, base_tree: &str, entries: &[NewTreeEntry]) -> Result<String>;

    async fn create_commit(&self, message: &str, tree_sha: &str, parent_sha: &str)
        -> Result<String>;

    /// Create `refs/heads/{branch}` pointing at `commit_sha`.
    async fn create_branch(&self, branch: &str, commit_sha: &str) -> Result<()>;

    async fn default_branch(&self) -> Result<String>;

    /// Open a pull request and return its URL.
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<String>;

    async fn create_issue_comment(&self, issue_number: u64, body: &str) -> Result<()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct GithubClient {
    http: reqwest::Client,
    logs_http: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl GithubClient {
    pub fn new(api_url: &str, owner: &str, repo: &str, token: &str) -> Result<Self> {
        Ok(GithubClient {
            http: build_client(API_TIMEOUT_SECS)?,
            logs_http: build_client(LOG_TIMEOUT_SECS)?,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        repo_api_url(&self.api_url, &self.owner, &self.repo, path)
    }

    fn request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &str,
    ) -> reqwest::RequestBuilder {
        client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, action: &str) -> Result<T> {
        let url = self.repo_url(path);
        debug!(%url, "GET");
        let resp = self
            .request(&self.http, reqwest::Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", action))?;
        let resp = ensure_success(resp, action).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response to {}", action))
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        action: &str,
    ) -> Result<T> {
        let url = self.repo_url(path);
        debug!(%url, "POST");
        let resp = self
            .request(&self.http, reqwest::Method::POST, &url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", action))?;
        let resp = ensure_success(resp, action).await?;
        resp.json()
            .await
            .with_context(|| format!("Failed to parse response to {}", action))
    }
}

#[async_trait]
impl CiBackend for GithubClient {
    async fn run_info(&self, run_id: u64) -> Result<RunInfo> {
        self.get_json(&format!("actions/runs/{}", run_id), "read workflow run")
            .await
    }

    async fn list_jobs(&self, run_id: u64) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for page in 1..=MAX_JOB_PAGES {
            let path = format!(
                "actions/runs/{}/jobs?per_page={}&page={}",
                run_id, JOBS_PER_PAGE, page
            );
            let batch: JobsPage = self.get_json(&path, "list workflow jobs").await?;
            let received = batch.jobs.len();
            jobs.extend(batch.jobs);
            if received < JOBS_PER_PAGE || jobs.len() >= batch.total_count {
                break;
            }
        }
        Ok(jobs)
    }

    async fn job_logs(&self, job_id: u64) -> Result<String> {
        // Redirects to a signed blob URL; reqwest drops the auth header on
        // the cross-host hop.
        let url = self.repo_url(&format!("actions/jobs/{}/logs", job_id));
        let resp = self
            .request(&self.logs_http, reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to download job logs")?;
        let resp = ensure_success(resp, "download job logs").await?;
        resp.text().await.context("Failed to read job logs")
    }

    async fn commit_tree(&self, commit_sha: &str) -> Result<String> {
        let commit: CommitResponse = self
            .get_json(&format!("git/commits/{}", commit_sha), "read commit")
            .await?;
        Ok(commit.tree.sha)
    }

    async fn tree_entries(&self, tree_sha: &str) -> Result<Vec<TreeEntry>> {
        let tree: TreeResponse = self
            .get_json(&format!("git/trees/{}?recursive=1", tree_sha), "read tree")
            .await?;
        Ok(tree.into_entries(tree_sha))
    }

    async fn create_blob(&self, content: &str) -> Result<String> {
        let body = serde_json::json!({ "content": content, "encoding": "utf-8" });
        let blob: ShaResponse = self.post_json("git/blobs", &body, "create blob").await?;
        Ok(blob.sha)
    }

    async fn create_tree(&self, base_tree: &str, entries: &[NewTreeEntry]) -> Result<String> {
        let body = serde_json::json!({ "base_tree": base_tree, "tree": entries });
        let tree: ShaResponse = self.post_json("git/trees", &body, "create tree").await?;
        Ok(tree.sha)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree_sha: &str,
        parent_sha: &str,
    ) -> Result<String> {
        let body = serde_json::json!({
            "message": message,
            "tree": tree_sha,
            "parents": [parent_sha],
        });
        let commit: ShaResponse = self.post_json("git/commits", &body, "create commit").await?;
        Ok(commit.sha)
    }

    async fn create_branch(&self, branch: &str, commit_sha: &str) -> Result<()> {
        let body = serde_json::json!({
            "ref": format!("refs/heads/{}", branch),
            "sha": commit_sha,
        });
        let _: serde_json::Value = self.post_json("git/refs", &body, "create branch").await?;
        Ok(())
    }

    async fn default_branch(&self) -> Result<String> {
        let url = format!("{}/repos/{}/{}", self.api_url, self.owner, self.repo);
        let resp = self
            .request(&self.http, reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to send request to read repository")?;
        let resp = ensure_success(resp, "read repository").await?;
        let repo: RepoResponse = resp
            .json()
            .await
            .context("Failed to parse repository response")?;
        Ok(repo.default_branch)
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<String> {
        let pr: CreatePrResponse = self
            .post_json("pulls", request, "create pull request")
            .await?;
        Ok(pr.html_url)
    }

    async fn create_issue_comment(&self, issue_number: u64, body: &str) -> Result<()> {
        let payload = serde_json::json!({ "body": body });
        let _: serde_json::Value = self
            .post_json(
                &format!("issues/{}/comments", issue_number),
                &payload,
                "comment on pull request",
            )
            .await?;
        Ok(())
    }
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("ci-triage/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

fn repo_api_url(api_url: &str, owner: &str, repo: &str, path: &str) -> String {
    format!(
        "{}/repos/{}/{}/{}",
        api_url.trim_end_matches('/'),
        owner,
        repo,
        path.trim_start_matches('/')
    )
}

async fn ensure_success(resp: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!(
        "Failed to {}: {}",
        action,
        api_error_message(status.as_u16(), &body)
    ))
}

/// Turn a GitHub error body into a short message, preferring the structured
/// `{message, errors[]}` form over the raw (sanitized) text.
fn api_error_message(status: u16, body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();

        return if detail.is_empty() {
            format!("GitHub API error ({}): {}", status, api_error.message)
        } else {
            format!(
                "GitHub API error ({}): {}: {}",
                status, api_error.message, detail
            )
        };
    }

    format!("GitHub API error ({}): {}", status, sanitize_error_body(body))
}

// ============================================================================
// Repository identity
// ============================================================================

/// Split an `owner/repo` slug such as `GITHUB_REPOSITORY`.
pub fn parse_repository_slug(slug: &str) -> Option<(String, String)> {
    let (owner, repo) = slug.trim().split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

/// Extract owner and repo from a git remote URL.
///
/// Supports:
/// - git@github.com:owner/repo.git
/// - https://github.com/owner/repo.git
/// - https://github.com/owner/repo
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    if let Some(rest) = url.strip_prefix("git@github.com:") {
        let path = rest.trim_end_matches(".git");
        let parts: Vec<&str> = path.splitn(2, '/').collect();
        if parts.len() == 2 {
            return Some((parts[0].to_string(), parts[1].to_string()));
        }
    }

    if let Ok(parsed) = url::Url::parse(url) {
        if parsed.host_str() == Some("github.com") {
            let path = parsed
                .path()
                .trim_start_matches('/')
                .trim_end_matches(".git");
            let parts: Vec<&str> = path.splitn(2, '/').collect();
            if parts.len() == 2 && !parts[1].is_empty() {
                return Some((parts[0].to_string(), parts[1].to_string()));
            }
        }
    }

    None
}

/// Get the owner and repo from the workspace's git remotes.
pub fn get_remote_info(repo_path: &Path) -> Result<(String, String)> {
    let repo = Repository::open(repo_path).context("Failed to open repository")?;

    for remote_name in ["origin", "upstream", "github"] {
        if let Ok(remote) = repo.find_remote(remote_name) {
            if let Some(found) = remote.url().and_then(parse_remote_url) {
                return Ok(found);
            }
        }
    }

    Err(anyhow::anyhow!(
        "No GitHub remote found in {}",
        repo_path.display()
    ))
}

// ============================================================================
// Tests
// ============================================================================
