//! Configuration management for editflow
//!
//! Settings live in `~/.config/editflow/config.toml` unless a path is given
//! explicitly. Every field has a default, so a missing file is not an error.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub controller: ControllerConfig,
    pub github: GitHubConfig,
    /// Chat records are written back here after a successful publish
    pub chat_sync: ChatSyncConfig,
    pub backends: Vec<BackendConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Submissions are rejected once this many entries are pending
    pub max_depth: usize,
    pub poll_timeout_ms: u64,
    /// Enables the durable snapshot when set
    pub snapshot_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            poll_timeout_ms: 1000,
            snapshot_path: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Pause after a job fails unexpectedly
    pub failure_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            failure_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub max_attempts: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base: String,
    pub read_timeout_secs: u64,
    pub tree_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    /// Folder names pruned from tree listings at any depth
    pub excluded_folders: Vec<String>,
    /// New branches are named `<prefix>-<uuid>`
    pub branch_prefix: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            read_timeout_secs: 30,
            tree_timeout_secs: 60,
            publish_timeout_secs: 60,
            excluded_folders: ["node_modules", ".git", "dist", "build", "coverage"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            branch_prefix: "ticketAgent".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSyncConfig {
    /// Base URL of the backend API; sync is disabled when unset
    pub api_base: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ChatSyncConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            timeout_secs: 15,
        }
    }
}

/// One registered proposal backend, selected by `llm_model_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

fn default_backend_timeout() -> u64 {
    180
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("editflow"))
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load from `path` (or the default location), apply environment
    /// overrides and clamp nonsensical values.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.sanitize();
        Ok(config)
    }

    /// Parse one TOML file. A file that exists but does not parse is moved
    /// aside and defaults are used.
    fn load_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    "Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                    err
                );
                Ok(Self::default())
            }
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(depth) = lookup("EDITFLOW_QUEUE_MAX_DEPTH").and_then(|v| v.parse().ok()) {
            self.queue.max_depth = depth;
        }
        if let Some(base) = lookup("EDITFLOW_GITHUB_API_BASE").filter(|v| !v.is_empty()) {
            self.github.api_base = base;
        }
        if let Some(base) = lookup("EDITFLOW_BACKEND_API").filter(|v| !v.is_empty()) {
            self.chat_sync.api_base = Some(base);
        }
        if let Some(level) = lookup("EDITFLOW_LOG").filter(|v| !v.is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn sanitize(&mut self) {
        self.queue.max_depth = self.queue.max_depth.max(1);
        self.queue.poll_timeout_ms = self.queue.poll_timeout_ms.clamp(10, 60_000);
        self.controller.max_attempts = self.controller.max_attempts.max(1);
        self.github.api_base = self.github.api_base.trim_end_matches('/').to_string();
        if self.github.branch_prefix.trim().is_empty() {
            self.github.branch_prefix = GitHubConfig::default().branch_prefix;
        }
        for backend in &mut self.backends {
            backend.timeout_secs = backend.timeout_secs.max(1);
        }
    }

    pub fn config_location(path: Option<&Path>) -> String {
        path.map(Path::to_path_buf)
            .or_else(Self::default_path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.queue.max_depth, 10);
        assert_eq!(config.controller.max_attempts, 3);
        assert_eq!(config.worker.failure_backoff_ms, 500);
        assert_eq!(config.github.excluded_folders.len(), 5);
        assert!(config.backends.is_empty());
        assert!(config.chat_sync.api_base.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [queue]
            max_depth = 4

            [[backends]]
            id = "claude"
            command = "./bin/propose"
            args = ["--model", "sonnet"]
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_depth, 4);
        assert_eq!(config.queue.poll_timeout_ms, 1000);
        assert_eq!(config.backends[0].timeout_secs, 180);
        assert_eq!(config.github.branch_prefix, "ticketAgent");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("EDITFLOW_QUEUE_MAX_DEPTH", "25"),
            ("EDITFLOW_GITHUB_API_BASE", "http://localhost:9000/"),
            ("EDITFLOW_LOG", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        config.sanitize();
        assert_eq!(config.queue.max_depth, 25);
        assert_eq!(config.github.api_base, "http://localhost:9000");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_sanitize_clamps_zero_values() {
        let mut config = Config::default();
        config.queue.max_depth = 0;
        config.controller.max_attempts = 0;
        config.github.branch_prefix = " ".to_string();
        config.sanitize();
        assert_eq!(config.queue.max_depth, 1);
        assert_eq!(config.controller.max_attempts, 1);
        assert_eq!(config.github.branch_prefix, "ticketAgent");
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[queue\nmax_depth = ").unwrap();

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(!path.exists());
        assert!(dir.path().join("config.toml.corrupt").exists());
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
