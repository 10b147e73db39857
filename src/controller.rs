//! Retry controller
//!
//! Runs one job end to end: list the tree, pick the working set, read the
//! files, then loop propose -> apply -> verify until the edits verify or the
//! attempt budget is spent. A failed attempt's content becomes the next
//! attempt's working files and its errors are appended to the plan.

use crate::error::{AgentError, AgentResult};
use crate::host::{FileContent, RepoAccess, RepoHost};
use crate::index::{self, Language};
use crate::job::{Job, JobOutcome};
use crate::notify::{self, Notifier};
use crate::patch::{self, FileSet, PatchOutcome, Proposal};
use crate::propose::{
    BackendRegistry, ContextFile, ProposalContext, ProposalGenerator, SelectionRequest,
};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

const EMPTY_ATTEMPT_FEEDBACK: &str =
    "The last attempt failed to generate any code changes. Please try again.";

/// Where a job currently is. Logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Fetching,
    Proposing,
    Applying,
    Verifying,
    Accepted,
    Retrying,
    Exhausted,
}

/// What one propose/apply/verify round decided.
enum Round {
    Accepted { description: String, changed: FileSet },
    Retry { feedback: String, files: Option<FileSet> },
}

pub struct RetryController {
    host: Arc<dyn RepoHost>,
    backends: BackendRegistry,
    notifier: Arc<dyn Notifier>,
    max_attempts: usize,
}

impl RetryController {
    pub fn new(
        host: Arc<dyn RepoHost>,
        backends: BackendRegistry,
        notifier: Arc<dyn Notifier>,
        max_attempts: usize,
    ) -> Self {
        Self {
            host,
            backends,
            notifier,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `job` to a terminal outcome. Never panics on job-level failures.
    pub async fn run(&self, job: &Job) -> JobOutcome {
        let span = info_span!("job", session = %job.session, repo = %job.entry.repo.full_name);
        match self.run_inner(job).instrument(span).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(session = %job.session, "job failed: {}", err);
                JobOutcome::Failed(err)
            }
        }
    }

    async fn run_inner(&self, job: &Job) -> AgentResult<JobOutcome> {
        let generator = self.backends.get(&job.entry.llm_model_type)?;
        let access = RepoAccess::for_job(job);

        transition(ControllerState::Fetching);
        notify::emit_progress(self.notifier.as_ref(), job, notify::MSG_ANALYZING_TREE).await;
        let tree = self
            .host
            .list_tree(&access)
            .await
            .map_err(|e| AgentError::TreeListingFailed(format!("{:#}", e)))?;

        let working_set = generator
            .select_files(&SelectionRequest {
                instruction: &job.entry.user_prompt,
                model: &job.entry.llm_model_name,
                tree: &tree,
            })
            .await
            .map_err(|e| AgentError::ProposalGenerationFailed(format!("{:#}", e)))?;
        info!(files = working_set.file_paths.len(), "working set selected");

        notify::emit_progress(self.notifier.as_ref(), job, notify::MSG_READING_FILES).await;
        let (originals, notes) = self.fetch(&access, &working_set.file_paths).await;

        let mut plan = working_set.plan;
        let mut files = originals.clone();

        for attempt in 1..=self.max_attempts {
            info!(attempt, max = self.max_attempts, "implementation attempt");
            notify::emit_progress(self.notifier.as_ref(), job, notify::MSG_GENERATING).await;

            let context = ProposalContext {
                instruction: job.entry.user_prompt.clone(),
                plan: plan.clone(),
                model: job.entry.llm_model_name.clone(),
                attempt,
                files: summarize(&files),
                notes: notes.clone(),
            };

            match self.round(generator.as_ref(), &context, &files, &originals).await? {
                Round::Accepted {
                    description,
                    changed,
                } => {
                    transition(ControllerState::Accepted);
                    let published = self
                        .host
                        .publish(&access, &changed, &description)
                        .await
                        .map_err(|e| AgentError::PublishFailed(format!("{:#}", e)))?;
                    info!(url = %published.url, attempt, "change set published");
                    return Ok(JobOutcome::Published(published));
                }
                Round::Retry {
                    feedback,
                    files: next,
                } => {
                    transition(ControllerState::Retrying);
                    plan = format!("{}\n\n{}", plan, feedback);
                    if let Some(next) = next {
                        files = next;
                    }
                }
            }
        }

        transition(ControllerState::Exhausted);
        Err(AgentError::RetriesExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Read every path. Unreadable files are left out of the map and
    /// described in the returned notes.
    async fn fetch(&self, access: &RepoAccess, paths: &[String]) -> (FileSet, Vec<String>) {
        let mut files = FileSet::new();
        let mut notes = Vec::new();
        for path in paths {
            match self.host.read_file(access, path).await {
                FileContent::Text(text) => {
                    files.insert(path.clone(), text);
                }
                unavailable => {
                    let reason = unavailable.describe_failure().unwrap_or_default();
                    let err = AgentError::ContextFetchFailed {
                        path: path.clone(),
                        reason: reason.clone(),
                    };
                    warn!("{}", err);
                    notes.push(reason);
                }
            }
        }
        (files, notes)
    }

    async fn round(
        &self,
        generator: &dyn ProposalGenerator,
        context: &ProposalContext,
        files: &FileSet,
        originals: &FileSet,
    ) -> AgentResult<Round> {
        transition(ControllerState::Proposing);
        let raw = generator
            .propose(context)
            .await
            .map_err(|e| AgentError::ProposalGenerationFailed(format!("{:#}", e)))?;

        let proposal = match Proposal::decode(&raw) {
            Ok(proposal) if !proposal.edits.is_empty() => proposal,
            Ok(_) => {
                return Ok(Round::Retry {
                    feedback: EMPTY_ATTEMPT_FEEDBACK.to_string(),
                    files: None,
                })
            }
            Err(err) if err.is_retryable() => {
                warn!("{}", err);
                return Ok(Round::Retry {
                    feedback: EMPTY_ATTEMPT_FEEDBACK.to_string(),
                    files: None,
                });
            }
            Err(err) => return Err(err),
        };

        transition(ControllerState::Applying);
        let applied = patch::apply(files, &proposal.description, &proposal.edits);
        let skipped: Vec<String> = applied.diagnostics.iter().map(|d| d.to_string()).collect();

        let changed = changed_files(&applied, originals);
        if changed.is_empty() {
            let mut feedback = EMPTY_ATTEMPT_FEEDBACK.to_string();
            for line in &skipped {
                feedback.push('\n');
                feedback.push_str(line);
            }
            return Ok(Round::Retry {
                feedback,
                files: None,
            });
        }

        transition(ControllerState::Verifying);
        // Earlier rounds' edits are carried forward, so everything that would
        // be published is re-verified, not just this round's touched files.
        let errors = verify_files(&changed);
        if errors.is_empty() {
            return Ok(Round::Accepted {
                description: applied.description,
                changed,
            });
        }

        let mut feedback = format!(
            "Verification failed with the following errors:\n{}",
            errors.join("\n")
        );
        for line in &skipped {
            feedback.push('\n');
            feedback.push_str(line);
        }
        feedback.push_str("\nPlease fix them.");
        Ok(Round::Retry {
            feedback,
            files: Some(applied.files),
        })
    }
}

fn transition(state: ControllerState) {
    debug!(state = ?state, "controller transition");
}

/// Attach language tags and declarations to each working file.
fn summarize(files: &FileSet) -> Vec<ContextFile> {
    files
        .iter()
        .map(|(path, content)| {
            let language = Language::from_path(path);
            let declarations = if language.is_supported() {
                index::extract(content, language).unwrap_or_else(|e| {
                    warn!(path = %path, "declaration extraction failed: {}", e);
                    Vec::new()
                })
            } else {
                Vec::new()
            };
            ContextFile {
                path: path.clone(),
                language,
                content: content.clone(),
                declarations,
            }
        })
        .collect()
}

/// Verify every file with a registered parser. Returns one message per
/// failing file.
fn verify_files(files: &FileSet) -> Vec<String> {
    let mut errors = Vec::new();
    for (path, content) in files {
        let language = Language::from_path(path);
        if !language.is_supported() {
            debug!(path = %path, "no parser registered, skipping verification");
            continue;
        }
        let message = match index::verify(content, language) {
            Ok(result) if result.ok => continue,
            Ok(result) => result
                .locator
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown location".to_string()),
            Err(e) => e.to_string(),
        };
        let err = AgentError::VerificationFailed {
            path: path.clone(),
            message,
        };
        warn!("{}", err);
        errors.push(err.to_string());
    }
    errors
}

/// Files whose final content differs from what was fetched.
fn changed_files(applied: &PatchOutcome, originals: &FileSet) -> FileSet {
    applied
        .files
        .iter()
        .filter(|(path, content)| originals.get(*path) != Some(*content))
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::job::fixtures;
    use crate::notify::testing::RecordingNotifier;

    const F_JS: &str = "function f(){\n  return 1;\n}\n";

    fn controller(
        host: Arc<FakeHost>,
        generator: Arc<ScriptedGenerator>,
    ) -> (RetryController, Arc<RecordingNotifier>) {
        let mut backends = BackendRegistry::new();
        backends.register("fake", generator);
        let notifier = Arc::new(RecordingNotifier::default());
        (
            RetryController::new(host, backends, notifier.clone(), 3),
            notifier,
        )
    }

    fn job() -> Job {
        Job::new(fixtures::entry("sock-1"))
    }

    #[tokio::test]
    async fn test_valid_first_attempt_is_published() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js"],
            &[&replace_doc("src/f.js", 2, 2, "  return 2;")],
        ));
        let (controller, notifier) = controller(host.clone(), generator.clone());

        let outcome = controller.run(&job()).await;
        assert!(outcome.is_published(), "{:?}", outcome);
        assert_eq!(generator.calls(), 1);

        let published = host.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0["src/f.js"], "function f(){\n  return 2;\n}\n");
        assert_eq!(published[0].1, "Scripted change");
        assert_eq!(
            notifier.progress_messages(),
            vec![
                notify::MSG_ANALYZING_TREE,
                notify::MSG_READING_FILES,
                notify::MSG_GENERATING
            ]
        );
    }

    #[tokio::test]
    async fn test_never_verifying_exhausts_after_exactly_three_attempts() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js"],
            &[&replace_doc("src/f.js", 2, 2, "  const x = ;")],
        ));
        let (controller, _) = controller(host.clone(), generator.clone());

        let outcome = controller.run(&job()).await;
        assert_eq!(
            outcome,
            JobOutcome::Failed(AgentError::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(generator.calls(), 3);
        assert!(host.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_then_valid_proposal() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js"],
            &["sorry, no JSON today", &replace_doc("src/f.js", 2, 2, "  return 2;")],
        ));
        let (controller, _) = controller(host, generator.clone());

        assert!(controller.run(&job()).await.is_published());
        let contexts = generator.contexts.lock().unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts[1].plan.ends_with(EMPTY_ATTEMPT_FEEDBACK));
        assert_eq!(contexts[1].attempt, 2);
    }

    #[tokio::test]
    async fn test_verification_failure_feeds_back_errors_and_content() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js"],
            &[
                &replace_doc("src/f.js", 2, 2, "  const x = ;"),
                &replace_doc("src/f.js", 2, 2, "  return 2;"),
            ],
        ));
        let (controller, _) = controller(host.clone(), generator.clone());

        assert!(controller.run(&job()).await.is_published());
        let contexts = generator.contexts.lock().unwrap();
        let second = &contexts[1];
        assert!(second
            .plan
            .contains("Verification failed with the following errors:"));
        assert!(second
            .plan
            .contains("Verification failed for src/f.js with error: line 2:"));
        assert!(second.plan.ends_with("Please fix them."));
        // The failed attempt's content is the next round's context.
        assert!(second.files[0].content.contains("const x = ;"));
        assert!(!second.files[0].declarations.is_empty());

        let published = host.published.lock().unwrap();
        assert_eq!(published[0].0["src/f.js"], "function f(){\n  return 2;\n}\n");
    }

    #[tokio::test]
    async fn test_file_broken_in_earlier_round_is_reverified() {
        let b_js = "function b(){\n  return 1;\n}\n";
        let host = Arc::new(FakeHost::with_files(&[("src/a.js", F_JS), ("src/b.js", b_js)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/a.js", "src/b.js"],
            &[
                &replace_doc("src/a.js", 2, 2, "  const x = ;"),
                &replace_doc("src/b.js", 2, 2, "  return 2;"),
            ],
        ));
        let (controller, _) = controller(host.clone(), generator.clone());

        let outcome = controller.run(&job()).await;
        assert_eq!(
            outcome,
            JobOutcome::Failed(AgentError::RetriesExhausted { attempts: 3 })
        );
        assert!(host.published.lock().unwrap().is_empty());

        let contexts = generator.contexts.lock().unwrap();
        assert!(contexts[2]
            .plan
            .contains("Verification failed for src/a.js with error: line 2:"));
    }

    #[tokio::test]
    async fn test_missing_file_is_reported_as_note() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js", "src/missing.js"],
            &[&replace_doc("src/f.js", 2, 2, "  return 2;")],
        ));
        let (controller, _) = controller(host, generator.clone());

        assert!(controller.run(&job()).await.is_published());
        let contexts = generator.contexts.lock().unwrap();
        assert_eq!(contexts[0].files.len(), 1);
        assert_eq!(contexts[0].notes.len(), 1);
        assert!(contexts[0].notes[0].contains("'src/missing.js' does not exist"));
    }

    #[tokio::test]
    async fn test_edit_for_unknown_file_alone_is_an_empty_attempt() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js"],
            &[
                &replace_doc("src/missing.js", 1, 1, "x"),
                &replace_doc("src/f.js", 2, 2, "  return 2;"),
            ],
        ));
        let (controller, _) = controller(host, generator.clone());

        assert!(controller.run(&job()).await.is_published());
        let contexts = generator.contexts.lock().unwrap();
        assert!(contexts[1].plan.contains("Skipped edit for src/missing.js"));
    }

    #[tokio::test]
    async fn test_only_changed_files_are_published() {
        let host = Arc::new(FakeHost::with_files(&[
            ("src/f.js", F_JS),
            ("README.md", "# widgets\n"),
        ]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js", "README.md"],
            &[&replace_doc("src/f.js", 2, 2, "  return 2;")],
        ));
        let (controller, _) = controller(host.clone(), generator);

        let outcome = controller.run(&job()).await;
        let JobOutcome::Published(set) = outcome else {
            panic!("expected publish");
        };
        assert_eq!(set.files, vec!["src/f.js"]);
    }

    #[tokio::test]
    async fn test_unverifiable_language_is_accepted() {
        let host = Arc::new(FakeHost::with_files(&[("notes.txt", "a\nb\n")]));
        let generator = Arc::new(ScriptedGenerator::new(
            &["notes.txt"],
            &[&replace_doc("notes.txt", 2, 2, "{{{ not code")],
        ));
        let (controller, _) = controller(host, generator);
        assert!(controller.run(&job()).await.is_published());
    }

    #[tokio::test]
    async fn test_publish_failure_is_terminal() {
        let host = Arc::new(FakeHost {
            fail_publish: true,
            ..FakeHost::with_files(&[("src/f.js", F_JS)])
        });
        let generator = Arc::new(ScriptedGenerator::new(
            &["src/f.js"],
            &[&replace_doc("src/f.js", 2, 2, "  return 2;")],
        ));
        let (controller, _) = controller(host, generator.clone());

        let outcome = controller.run(&job()).await;
        assert!(matches!(
            outcome,
            JobOutcome::Failed(AgentError::PublishFailed(_))
        ));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_without_touching_host() {
        let host = Arc::new(FakeHost::with_files(&[("src/f.js", F_JS)]));
        let generator = Arc::new(ScriptedGenerator::new(&["src/f.js"], &["{}"]));
        let (controller, notifier) = controller(host, generator.clone());

        let mut entry = fixtures::entry("sock-1");
        entry.llm_model_type = "llama".to_string();
        let outcome = controller.run(&Job::new(entry)).await;
        assert_eq!(
            outcome,
            JobOutcome::Failed(AgentError::UnknownBackend("llama".to_string()))
        );
        assert_eq!(generator.calls(), 0);
        assert!(notifier.progress_messages().is_empty());
    }
}
