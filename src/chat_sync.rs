//! Write-back of chat records after a successful publish

use crate::config::ChatSyncConfig;
use crate::job::ChatRecord;
use crate::util::sanitize_error_body;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn save(&self, project_id: &str, chat: &ChatRecord) -> Result<()>;
}

#[derive(Serialize)]
struct SaveChatRequest<'a> {
    chat: &'a ChatRecord,
}

#[derive(Deserialize)]
struct SaveChatError {
    error: Option<String>,
}

/// `PUT {api_base}/project/{project}/chat/{chat}` with `{"chat": ...}`.
pub struct HttpChatStore {
    client: reqwest::Client,
    api_base: String,
    timeout: Duration,
}

impl HttpChatStore {
    /// `None` when no backend API is configured.
    pub fn from_config(config: &ChatSyncConfig) -> Result<Option<Self>> {
        let Some(api_base) = config.api_base.as_deref().filter(|b| !b.is_empty()) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Some(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        }))
    }

    fn chat_url(&self, project_id: &str, chat_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .with_context(|| format!("Invalid backend API base: {}", self.api_base))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Backend API base cannot be a base URL"))?
            .pop_if_empty()
            .extend(["project", project_id, "chat", chat_id]);
        Ok(url)
    }
}

#[async_trait]
impl ChatStore for HttpChatStore {
    async fn save(&self, project_id: &str, chat: &ChatRecord) -> Result<()> {
        let url = self.chat_url(project_id, &chat.id)?;
        let resp = self
            .client
            .put(url)
            .timeout(self.timeout)
            .json(&SaveChatRequest { chat })
            .send()
            .await
            .context("Failed to send chat update")?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<SaveChatError>(&body)
            .ok()
            .and_then(|e| e.error)
            .unwrap_or(body);
        Err(anyhow::anyhow!(
            "Chat update failed ({}): {}",
            status,
            sanitize_error_body(&detail)
        ))
    }
}
