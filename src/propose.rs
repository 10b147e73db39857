//! Proposal generation backends
//!
//! A backend is an opaque capability: given the instruction and the
//! structural summary of the working files it returns a proposal document,
//! and given the repository tree it picks which files to work on. Backends
//! are registered by id and selected per job through `llm_model_type`.

use crate::config::BackendConfig;
use crate::error::{AgentError, AgentResult};
use crate::host::TreeNode;
use crate::index::{Declaration, Language};
use crate::patch::proposal::{extract_json_fragment, strip_markdown_fences};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Input for choosing the working set.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionRequest<'a> {
    pub instruction: &'a str,
    pub model: &'a str,
    pub tree: &'a [TreeNode],
}

/// The plan and the repository paths a job will read and edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub file_paths: Vec<String>,
}

/// One file as presented to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextFile {
    pub path: String,
    pub language: Language,
    pub content: String,
    pub declarations: Vec<Declaration>,
}

/// Everything a backend sees for one proposal round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposalContext {
    pub instruction: String,
    /// Plan text, amended with feedback from failed attempts.
    pub plan: String,
    pub model: String,
    pub attempt: usize,
    pub files: Vec<ContextFile>,
    /// Files that could not be read, described for the backend.
    pub notes: Vec<String>,
}

#[async_trait]
pub trait ProposalGenerator: Send + Sync {
    async fn select_files(&self, request: &SelectionRequest<'_>) -> anyhow::Result<WorkingSet>;

    /// Return the raw proposal document. Decoding happens at the caller.
    async fn propose(&self, context: &ProposalContext) -> anyhow::Result<String>;
}

/// Backends keyed by id.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ProposalGenerator>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(backends: &[BackendConfig]) -> Self {
        let mut registry = Self::new();
        for backend in backends {
            registry.register(&backend.id, Arc::new(CommandProposer::new(backend.clone())));
        }
        registry
    }

    pub fn register(&mut self, id: &str, generator: Arc<dyn ProposalGenerator>) {
        self.backends.insert(id.to_string(), generator);
    }

    pub fn get(&self, id: &str) -> AgentResult<Arc<dyn ProposalGenerator>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownBackend(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[derive(Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
enum CommandTask<'a> {
    SelectFiles(&'a SelectionRequest<'a>),
    Propose(&'a ProposalContext),
}

/// Runs an external command per request: the task is written to stdin as
/// JSON and the response is read from stdout.
pub struct CommandProposer {
    config: BackendConfig,
}

impl CommandProposer {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    async fn run(&self, task: &CommandTask<'_>) -> anyhow::Result<String> {
        let input = serde_json::to_vec(task).context("Failed to serialize backend input")?;

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start backend '{}'", self.config.id))?;

        // Feed stdin concurrently so a chatty backend cannot fill stdout first.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let result = stdin.write_all(&input).await;
                drop(stdin);
                result
            })
        });

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Backend '{}' timed out after {} seconds",
                self.config.id,
                self.config.timeout_secs
            )
        })??;

        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.await {
                debug!(backend = %self.config.id, "backend did not read all input: {}", e);
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Backend '{}' exited with {}: {}",
                self.config.id,
                output.status,
                crate::util::truncate(stderr.trim(), 200)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!(backend = %self.config.id, bytes = stdout.len(), "backend responded");
        Ok(stdout)
    }
}

#[async_trait]
impl ProposalGenerator for CommandProposer {
    async fn select_files(&self, request: &SelectionRequest<'_>) -> anyhow::Result<WorkingSet> {
        let raw = self.run(&CommandTask::SelectFiles(request)).await?;
        parse_working_set(&raw)
    }

    async fn propose(&self, context: &ProposalContext) -> anyhow::Result<String> {
        self.run(&CommandTask::Propose(context)).await
    }
}

fn parse_working_set(raw: &str) -> anyhow::Result<WorkingSet> {
    let clean = strip_markdown_fences(raw);
    let json = extract_json_fragment(clean, '{', '}').unwrap_or(clean);
    serde_json::from_str(json).context("Backend returned an unreadable working set")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl ProposalGenerator for Fixed {
        async fn select_files(&self, _: &SelectionRequest<'_>) -> anyhow::Result<WorkingSet> {
            Ok(WorkingSet::default())
        }

        async fn propose(&self, _: &ProposalContext) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    fn context() -> ProposalContext {
        ProposalContext {
            instruction: "Make f return 2".to_string(),
            plan: "Edit f".to_string(),
            model: "m".to_string(),
            attempt: 1,
            files: Vec::new(),
            notes: Vec::new(),
        }
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register("gpt", Arc::new(Fixed));
        assert!(registry.get("gpt").is_ok());
        let err = registry.get("llama").err().unwrap();
        assert_eq!(err.to_string(), "Invalid LLM model type: llama");
    }

    #[test]
    fn test_registry_from_config() {
        let registry = BackendRegistry::from_config(&[
            BackendConfig {
                id: "gemini".to_string(),
                command: "propose".to_string(),
                args: Vec::new(),
                timeout_secs: 10,
            },
            BackendConfig {
                id: "claude".to_string(),
                command: "propose".to_string(),
                args: Vec::new(),
                timeout_secs: 10,
            },
        ]);
        assert_eq!(registry.ids(), vec!["claude", "gemini"]);
    }

    #[test]
    fn test_parse_working_set_from_fenced_output() {
        let raw = "```json\n{\"plan\": \"Edit App\", \"file_paths\": [\"src/App.jsx\"]}\n```";
        let set = parse_working_set(raw).unwrap();
        assert_eq!(set.plan, "Edit App");
        assert_eq!(set.file_paths, vec!["src/App.jsx"]);
        assert!(parse_working_set("no idea").is_err());
    }

    #[test]
    fn test_command_task_is_tagged() {
        let ctx = context();
        let json = serde_json::to_value(CommandTask::Propose(&ctx)).unwrap();
        assert_eq!(json["task"], "propose");
        assert_eq!(json["instruction"], "Make f return 2");
        assert_eq!(json["attempt"], 1);
    }

    #[cfg(unix)]
    fn shell(script: &str, timeout_secs: u64) -> CommandProposer {
        CommandProposer::new(BackendConfig {
            id: "sh".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_secs,
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_proposer_reads_stdout() {
        let proposer = shell("cat > /dev/null; echo '{\"changes\": []}'", 10);
        let raw = proposer.propose(&context()).await.unwrap();
        assert_eq!(raw.trim(), "{\"changes\": []}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_proposer_receives_task_on_stdin() {
        let proposer = shell("cat", 10);
        let raw = proposer.propose(&context()).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(echoed["plan"], "Edit f");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_proposer_failure_and_timeout() {
        let failing = shell("cat > /dev/null; echo boom >&2; exit 3", 10);
        let err = failing.propose(&context()).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        let slow = shell("cat > /dev/null; sleep 5", 1);
        let err = slow.propose(&context()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
