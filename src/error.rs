//! Error taxonomy for the edit pipeline.
//!
//! Every failure inside one job ends up as one of these variants, and the
//! worker turns it into exactly one user-visible `agent_error` event.

use thiserror::Error;

/// Errors produced while admitting and processing edit jobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The queue already holds `max_depth` entries.
    #[error("Agent queue is full please try again in a few seconds")]
    AdmissionRejected { max_depth: usize },

    /// One file could not be read from the repository host.
    #[error("could not read {path}: {reason}")]
    ContextFetchFailed { path: String, reason: String },

    /// The repository tree could not be listed.
    #[error("failed to list repository tree: {0}")]
    TreeListingFailed(String),

    /// The generator returned a document that does not decode.
    #[error("proposal could not be decoded: {0}")]
    ProposalMalformed(String),

    /// The generator call itself failed (transport, timeout, non-zero exit).
    #[error("proposal generation failed: {0}")]
    ProposalGenerationFailed(String),

    /// The job names a generation backend that is not registered.
    #[error("Invalid LLM model type: {0}")]
    UnknownBackend(String),

    /// One edit was out of bounds or targeted an unknown file.
    #[error("edit for {path} skipped: {reason}")]
    PatchEditInvalid { path: String, reason: String },

    /// Edited content no longer parses.
    #[error("Verification failed for {path} with error: {message}.")]
    VerificationFailed { path: String, message: String },

    /// No attempt within the budget produced content that verified.
    #[error("Failed to implement and verify the changes after {attempts} attempts.")]
    RetriesExhausted { attempts: usize },

    /// Any step of the multi-step publish sequence failed.
    #[error("failed to publish change set: {0}")]
    PublishFailed(String),

    /// No structural parser is registered for the language tag.
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}

impl AgentError {
    /// True for failures the retry controller answers with another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ProposalMalformed(_) | AgentError::VerificationFailed { .. }
        )
    }
}

/// Convenience result alias.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
