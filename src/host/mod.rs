//! Repository host capability
//!
//! Reading files, listing the tree and publishing a change set are the only
//! things the pipeline needs from the remote host. `github` implements them
//! over the GitHub REST API; tests use in-memory fakes.

pub mod github;
pub mod tree;

pub use github::GitHubHost;
pub use tree::TreeNode;

use crate::job::{Job, PublishedChangeSet};
use crate::patch::FileSet;
use async_trait::async_trait;
use std::fmt;

/// Coordinates and credential for one repository.
#[derive(Clone)]
pub struct RepoAccess {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub token: String,
}

impl RepoAccess {
    pub fn for_job(job: &Job) -> Self {
        Self {
            owner: job.owner().to_string(),
            name: job.repo_name().to_string(),
            default_branch: job.entry.repo.default_branch.clone(),
            token: job.entry.access_token.clone(),
        }
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Debug for RepoAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoAccess")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .field("default_branch", &self.default_branch)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Why a file could not be read. Treated as data: the job continues
/// without the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    NotFound,
    IsDirectory,
    /// Present but not valid UTF-8 (binary), or the response had no content.
    Unreadable { binary: bool },
    Http(u16),
    /// The request never produced a response.
    Transport(String),
}

/// Result of reading one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Unavailable { path: String, failure: FetchFailure },
}

impl FileContent {
    pub fn unavailable(path: &str, failure: FetchFailure) -> Self {
        FileContent::Unavailable {
            path: path.to_string(),
            failure,
        }
    }

    /// Descriptive message for an unavailable file, `None` for text.
    pub fn describe_failure(&self) -> Option<String> {
        let FileContent::Unavailable { path, failure } = self else {
            return None;
        };
        let message = match failure {
            FetchFailure::NotFound => format!(
                "ERROR: File '{}' does not exist in the repository. Please check the repo tree \
                 first to see available files. If you're trying to create a new file, you don't \
                 need to read it - instead, look at similar existing files for patterns.",
                path
            ),
            FetchFailure::IsDirectory => format!(
                "ERROR: '{}' is a directory, not a file. Use get_repo_tree to see its contents.",
                path
            ),
            FetchFailure::Unreadable { binary: true } => format!(
                "ERROR: File '{}' exists but couldn't be decoded as text. It might be a binary file.",
                path
            ),
            FetchFailure::Unreadable { binary: false } => format!(
                "ERROR: Unable to read content for '{}'. This might be a directory or special file.",
                path
            ),
            FetchFailure::Http(status) => format!(
                "ERROR: Failed to fetch file content (HTTP {}). Please verify the file path \
                 exists in the repo tree.",
                status
            ),
            FetchFailure::Transport(reason) => format!(
                "ERROR: Failed to fetch file content ({}). Please verify the file path exists \
                 in the repo tree.",
                reason
            ),
        };
        Some(message)
    }
}

/// The remote repository host.
#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Read one file from the default branch.
    async fn read_file(&self, repo: &RepoAccess, path: &str) -> FileContent;

    /// List the pruned, nested tree of the default branch.
    async fn list_tree(&self, repo: &RepoAccess) -> anyhow::Result<Vec<TreeNode>>;

    /// Publish `files` as one commit on a fresh branch and open a change
    /// request against the default branch. Either every step succeeds or
    /// an error is returned.
    async fn publish(
        &self,
        repo: &RepoAccess,
        files: &FileSet,
        description: &str,
    ) -> anyhow::Result<PublishedChangeSet>;
}
