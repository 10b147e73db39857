//! Queue entries and job outcomes
//!
//! `QueueEntry` is the JSON document a client submits and the queue stores.
//! Field names follow the wire format exactly, including the camelCase keys
//! of the chat record.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOwner {
    pub login: String,
    pub id: u64,
}

/// Target repository reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    pub owner: RepoOwner,
    #[serde(default)]
    pub html_url: String,
    pub default_branch: String,
}

/// The conversation record the request belongs to. Echoed back in every
/// terminal event; `pullRequestUrl` is filled in on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pull_request_url: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub chat_url: String,
    #[serde(default)]
    pub seen: bool,
}

/// One submitted unit of work, as stored in the queue.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_prompt: String,
    pub repo: RepoRef,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub chat: ChatRecord,
    pub access_token: String,
    pub llm_model_type: String,
    #[serde(default)]
    pub llm_model_name: String,
    pub socket_id: String,
}

// Keep the credential out of logs.
impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("user_prompt", &self.user_prompt)
            .field("repo", &self.repo.full_name)
            .field("project_id", &self.project_id)
            .field("chat", &self.chat.id)
            .field("access_token", &"<redacted>")
            .field("llm_model_type", &self.llm_model_type)
            .field("llm_model_name", &self.llm_model_name)
            .field("socket_id", &self.socket_id)
            .finish()
    }
}

/// A dequeued entry being processed by the worker.
#[derive(Debug, Clone)]
pub struct Job {
    /// Session id reported in terminal events.
    pub session: Uuid,
    pub entry: QueueEntry,
}

impl Job {
    pub fn new(entry: QueueEntry) -> Self {
        Self {
            session: Uuid::new_v4(),
            entry,
        }
    }

    pub fn owner(&self) -> &str {
        &self.entry.repo.owner.login
    }

    pub fn repo_name(&self) -> &str {
        &self.entry.repo.name
    }

    /// Channels that receive this job's events: the requester's session
    /// channel, then the per-user channel when an email is known.
    pub fn channels(&self) -> Vec<String> {
        let mut channels = vec![self.entry.socket_id.clone()];
        let email = self.entry.chat.user_email.trim();
        if !email.is_empty() && email != self.entry.socket_id {
            channels.push(email.to_string());
        }
        channels
    }
}

/// Reference to a published change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedChangeSet {
    pub url: String,
    pub branch: String,
    pub files: Vec<String>,
}

/// Terminal result of one controller run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Published(PublishedChangeSet),
    Failed(AgentError),
}

impl JobOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, JobOutcome::Published(_))
    }
}
