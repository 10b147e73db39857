//! GitHub REST implementation of the repository host
//!
//! Reads go through the contents API, tree listing resolves the branch ref
//! to a recursive git tree, and publishing builds one commit out of blobs on
//! a fresh branch before opening a pull request.

use super::tree::{build_tree, FlatEntry, TreeNode};
use super::{FetchFailure, FileContent, RepoAccess, RepoHost};
use crate::config::GitHubConfig;
use crate::job::PublishedChangeSet;
use crate::patch::FileSet;
use crate::util::sanitize_error_body;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

const USER_AGENT: &str = "editflow";
const COMMIT_MESSAGE: &str = "Automated commit from agent";
const PR_BODY: &str = "This PR was created automatically by the agent. Please review and merge.";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Deserialize)]
struct ContentResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct GitObject {
    sha: String,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: GitObject,
}

#[derive(Deserialize)]
struct CommitResponse {
    tree: GitObject,
}

#[derive(Deserialize)]
struct TreeListing {
    #[serde(default)]
    tree: Vec<FlatEntry>,
}

#[derive(Deserialize)]
struct ShaResponse {
    sha: String,
}

#[derive(Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

#[derive(Serialize)]
struct CreateBlobRequest<'a> {
    content: &'a str,
    encoding: &'static str,
}

#[derive(Serialize)]
struct TreeItem<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    sha: String,
}

#[derive(Serialize)]
struct CreateTreeRequest<'a> {
    base_tree: &'a str,
    tree: Vec<TreeItem<'a>>,
}

#[derive(Serialize)]
struct CreateCommitRequest<'a> {
    message: &'static str,
    tree: &'a str,
    parents: [&'a str; 1],
}

#[derive(Serialize)]
struct UpdateRefRequest<'a> {
    sha: &'a str,
}

#[derive(Serialize)]
struct CreatePrRequest<'a> {
    title: &'a str,
    body: &'static str,
    head: &'a str,
    base: &'a str,
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
// Client
// ============================================================================

pub struct GitHubHost {
    client: reqwest::Client,
    config: GitHubConfig,
}

impl GitHubHost {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, config })
    }

    /// `{api_base}/repos/{owner}/{repo}/{segments...}` with each segment
    /// percent-encoded.
    fn repo_url(&self, repo: &RepoAccess, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.api_base)
            .with_context(|| format!("Invalid GitHub API base: {}", self.config.api_base))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("GitHub API base cannot be a base URL"))?;
            path.pop_if_empty();
            path.push("repos").push(&repo.owner).push(&repo.name);
            for segment in segments {
                for part in segment.split('/').filter(|p| !p.is_empty()) {
                    path.push(part);
                }
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, repo: &RepoAccess, timeout: u64) -> RequestBuilder {
        self.client
            .request(method, url)
            .timeout(Duration::from_secs(timeout))
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", repo.token))
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
        repo: &RepoAccess,
        timeout: u64,
        step: &str,
    ) -> Result<T> {
        let resp = self
            .request(Method::GET, url, repo, timeout)
            .send()
            .await
            .with_context(|| format!("Failed to {}", step))?;
        let resp = expect_status(resp, StatusCode::OK, step).await?;
        resp.json()
            .await
            .with_context(|| format!("Unexpected response while trying to {}", step))
    }

    async fn send_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        url: Url,
        repo: &RepoAccess,
        body: &B,
        expected: StatusCode,
        step: &str,
    ) -> Result<T> {
        let resp = self
            .request(method, url, repo, self.config.publish_timeout_secs)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to {}", step))?;
        let resp = expect_status(resp, expected, step).await?;
        resp.json()
            .await
            .with_context(|| format!("Unexpected response while trying to {}", step))
    }
}

/// Turn a non-`expected` response into a descriptive error.
async fn expect_status(resp: Response, expected: StatusCode, step: &str) -> Result<Response> {
    let status = resp.status();
    if status == expected {
        return Ok(resp);
    }
    let error_body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!(
        "Failed to {}: {} {}",
        step,
        status.as_u16(),
        describe_api_error(&error_body)
    ))
}

fn describe_api_error(body: &str) -> String {
    if let Ok(api_error) = serde_json::from_str::<ApiErrorResponse>(body) {
        let detail = api_error
            .errors
            .first()
            .and_then(|e| e.message.clone())
            .unwrap_or_default();
        let msg = if detail.is_empty() {
            api_error.message
        } else {
            format!("{}: {}", api_error.message, detail)
        };
        return sanitize_error_body(&msg);
    }
    sanitize_error_body(body)
}

/// Decode the base64 payload of a contents response. GitHub wraps the
/// encoding at 60 columns.
fn decode_content(encoded: &str) -> Option<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .ok()?;
    String::from_utf8(bytes).ok()
}

/// Classify a successful contents response body.
fn classify_content(path: &str, body: serde_json::Value) -> FileContent {
    if body.is_array() {
        return FileContent::unavailable(path, FetchFailure::IsDirectory);
    }
    let parsed: Option<ContentResponse> = serde_json::from_value(body).ok();
    match parsed.and_then(|c| c.content) {
        Some(encoded) => match decode_content(&encoded) {
            Some(text) => FileContent::Text(text),
            None => FileContent::unavailable(path, FetchFailure::Unreadable { binary: true }),
        },
        None => FileContent::unavailable(path, FetchFailure::Unreadable { binary: false }),
    }
}

#[async_trait]
impl RepoHost for GitHubHost {
    async fn read_file(&self, repo: &RepoAccess, path: &str) -> FileContent {
        debug!(repo = %repo.slug(), path, "reading file");
        let url = match self.repo_url(repo, &["contents", path]) {
            Ok(url) => url,
            Err(e) => return FileContent::unavailable(path, FetchFailure::Transport(e.to_string())),
        };

        let resp = match self
            .request(Method::GET, url, repo, self.config.read_timeout_secs)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return FileContent::unavailable(path, FetchFailure::Transport(e.to_string())),
        };

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return FileContent::unavailable(path, FetchFailure::NotFound),
            status => return FileContent::unavailable(path, FetchFailure::Http(status.as_u16())),
        }

        match resp.json::<serde_json::Value>().await {
            Ok(body) => classify_content(path, body),
            Err(_) => FileContent::unavailable(path, FetchFailure::Unreadable { binary: false }),
        }
    }

    async fn list_tree(&self, repo: &RepoAccess) -> Result<Vec<TreeNode>> {
        let timeout = self.config.read_timeout_secs;
        let ref_url = self.repo_url(repo, &["git/refs/heads", repo.default_branch.as_str()])?;
        let ref_json: serde_json::Value = self
            .get_json(ref_url, repo, timeout, "fetch branch ref")
            .await?;
        // A prefix match returns an array of refs.
        let ref_json = match ref_json {
            serde_json::Value::Array(mut refs) if !refs.is_empty() => refs.swap_remove(0),
            other => other,
        };
        let reference: RefResponse = serde_json::from_value(ref_json)
            .context("Unexpected ref JSON structure")?;

        let object_url = Url::parse(&reference.object.url).context("Invalid commit object URL")?;
        let commit: CommitResponse = self
            .get_json(object_url, repo, timeout, "fetch commit object")
            .await?;

        let mut tree_url = Url::parse(&commit.tree.url).context("Commit JSON missing tree URL")?;
        tree_url.query_pairs_mut().append_pair("recursive", "1");
        let listing: TreeListing = self
            .get_json(tree_url, repo, self.config.tree_timeout_secs, "fetch tree")
            .await?;

        debug!(repo = %repo.slug(), entries = listing.tree.len(), "listed tree");
        Ok(build_tree(&listing.tree, &self.config.excluded_folders))
    }

    async fn publish(
        &self,
        repo: &RepoAccess,
        files: &FileSet,
        description: &str,
    ) -> Result<PublishedChangeSet> {
        let timeout = self.config.publish_timeout_secs;

        let head_url = self.repo_url(repo, &["git/ref/heads", repo.default_branch.as_str()])?;
        let head: RefResponse = self
            .get_json(head_url, repo, timeout, "get branch")
            .await?;
        let base_sha = head.object.sha;

        let branch = format!("{}-{}", self.config.branch_prefix, Uuid::new_v4());
        let _: serde_json::Value = self
            .send_json(
                Method::POST,
                self.repo_url(repo, &["git/refs"])?,
                repo,
                &CreateRefRequest {
                    reference: format!("refs/heads/{}", branch),
                    sha: &base_sha,
                },
                StatusCode::CREATED,
                "create branch",
            )
            .await?;
        info!(repo = %repo.slug(), branch = %branch, "created branch");

        let mut tree = Vec::with_capacity(files.len());
        for (path, content) in files {
            let blob: ShaResponse = self
                .send_json(
                    Method::POST,
                    self.repo_url(repo, &["git/blobs"])?,
                    repo,
                    &CreateBlobRequest {
                        content,
                        encoding: "utf-8",
                    },
                    StatusCode::CREATED,
                    "create blob",
                )
                .await?;
            tree.push(TreeItem {
                path,
                mode: "100644",
                kind: "blob",
                sha: blob.sha,
            });
        }

        let base_commit: CommitResponse = self
            .get_json(
                self.repo_url(repo, &["git/commits", base_sha.as_str()])?,
                repo,
                timeout,
                "get base tree",
            )
            .await?;

        let new_tree: ShaResponse = self
            .send_json(
                Method::POST,
                self.repo_url(repo, &["git/trees"])?,
                repo,
                &CreateTreeRequest {
                    base_tree: &base_commit.tree.sha,
                    tree,
                },
                StatusCode::CREATED,
                "create tree",
            )
            .await?;

        let commit: ShaResponse = self
            .send_json(
                Method::POST,
                self.repo_url(repo, &["git/commits"])?,
                repo,
                &CreateCommitRequest {
                    message: COMMIT_MESSAGE,
                    tree: &new_tree.sha,
                    parents: [base_sha.as_str()],
                },
                StatusCode::CREATED,
                "create commit",
            )
            .await?;

        let _: serde_json::Value = self
            .send_json(
                Method::PATCH,
                self.repo_url(repo, &["git/refs/heads", branch.as_str()])?,
                repo,
                &UpdateRefRequest { sha: &commit.sha },
                StatusCode::OK,
                "update ref",
            )
            .await?;

        let pr: CreatePrResponse = self
            .send_json(
                Method::POST,
                self.repo_url(repo, &["pulls"])?,
                repo,
                &CreatePrRequest {
                    title: description,
                    body: PR_BODY,
                    head: &branch,
                    base: &repo.default_branch,
                },
                StatusCode::CREATED,
                "create pull request",
            )
            .await?;

        info!(repo = %repo.slug(), url = %pr.html_url, files = files.len(), "opened pull request");
        Ok(PublishedChangeSet {
            url: pr.html_url,
            branch,
            files: files.keys().cloned().collect(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
