//! Patch application
//!
//! Applies a batch of position-addressed edits to an in-memory file set.
//! Replace edits on one file run bottom-up (descending start line) so the
//! line numbers of edits not yet applied stay valid against the current text.
//! An edit that cannot be applied is skipped and reported; it never aborts
//! the rest of the batch.

pub mod proposal;

pub use proposal::Proposal;

use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Working mapping from repository path to file text.
pub type FileSet = BTreeMap<String, String>;

/// One instruction to transform a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Edit {
    /// Create (or overwrite) a file with the full content.
    Create { path: String, content: String },
    /// Replace the inclusive, 1-based line range with `content`.
    Replace {
        path: String,
        start_line: usize,
        end_line: usize,
        content: String,
    },
}

impl Edit {
    pub fn path(&self) -> &str {
        match self {
            Edit::Create { path, .. } | Edit::Replace { path, .. } => path,
        }
    }
}

/// Why an edit was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The edit names a file that was never provided as context.
    UnknownFile,
    /// The range does not satisfy `1 <= start <= end <= line_count`.
    OutOfBounds { line_count: usize },
}

/// A skipped edit, kept for logs and for the next attempt's instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDiagnostic {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl std::fmt::Display for PatchDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            SkipReason::UnknownFile => write!(
                f,
                "Skipped edit for {}: the file was not provided as context",
                self.path
            ),
            SkipReason::OutOfBounds { line_count } => write!(
                f,
                "Skipped edit for {}: invalid line numbers ({}-{}) for a file of {} lines",
                self.path, self.start_line, self.end_line, line_count
            ),
        }
    }
}

impl From<&PatchDiagnostic> for AgentError {
    fn from(diagnostic: &PatchDiagnostic) -> Self {
        let reason = match &diagnostic.reason {
            SkipReason::UnknownFile => "file was not provided as context".to_string(),
            SkipReason::OutOfBounds { line_count } => format!(
                "lines {}-{} outside 1-{}",
                diagnostic.start_line, diagnostic.end_line, line_count
            ),
        };
        AgentError::PatchEditInvalid {
            path: diagnostic.path.clone(),
            reason,
        }
    }
}

/// Result of applying one batch of edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub description: String,
    /// Every file, including the ones no edit touched.
    pub files: FileSet,
    /// Paths changed by at least one applied edit.
    pub touched: BTreeSet<String>,
    pub diagnostics: Vec<PatchDiagnostic>,
}

/// Decode a raw proposal document and apply it to `original`.
pub fn apply_document(original: &FileSet, raw: &str) -> AgentResult<PatchOutcome> {
    let proposal = Proposal::decode(raw)?;
    Ok(apply(original, &proposal.description, &proposal.edits))
}

/// Apply `edits` to a copy of `original`.
pub fn apply(original: &FileSet, description: &str, edits: &[Edit]) -> PatchOutcome {
    let mut files = original.clone();
    let mut touched = BTreeSet::new();
    let mut diagnostics = Vec::new();

    // Creation has no ordering dependency.
    let mut replaces: BTreeMap<&str, Vec<(usize, usize, &str)>> = BTreeMap::new();
    for edit in edits {
        match edit {
            Edit::Create { path, content } => {
                debug!(path = %path, "creating file");
                files.insert(path.clone(), content.clone());
                touched.insert(path.clone());
            }
            Edit::Replace {
                path,
                start_line,
                end_line,
                content,
            } => {
                replaces
                    .entry(path.as_str())
                    .or_default()
                    .push((*start_line, *end_line, content.as_str()));
            }
        }
    }

    for (path, mut ranges) in replaces {
        let Some(text) = files.get_mut(path) else {
            for (start_line, end_line, _) in ranges {
                let diagnostic = PatchDiagnostic {
                    path: path.to_string(),
                    start_line,
                    end_line,
                    reason: SkipReason::UnknownFile,
                };
                warn!("{}", AgentError::from(&diagnostic));
                diagnostics.push(diagnostic);
            }
            continue;
        };

        // Stable sort: equal start lines keep their submitted order.
        ranges.sort_by(|a, b| b.0.cmp(&a.0));

        for (start_line, end_line, content) in ranges {
            match splice_lines(text, start_line, end_line, content) {
                Ok(updated) => {
                    *text = updated;
                    touched.insert(path.to_string());
                }
                Err(reason) => {
                    let diagnostic = PatchDiagnostic {
                        path: path.to_string(),
                        start_line,
                        end_line,
                        reason,
                    };
                    warn!("{}", AgentError::from(&diagnostic));
                    diagnostics.push(diagnostic);
                }
            }
        }
    }

    PatchOutcome {
        description: description.to_string(),
        files,
        touched,
        diagnostics,
    }
}

/// Replace lines `start..=end` (1-based) of `text` with `replacement`,
/// keeping the file's line ending style and trailing newline.
fn splice_lines(
    text: &str,
    start: usize,
    end: usize,
    replacement: &str,
) -> Result<String, SkipReason> {
    let lines: Vec<&str> = text.lines().collect();
    let line_count = lines.len();
    if start == 0 || start > line_count || end < start || end > line_count {
        return Err(SkipReason::OutOfBounds { line_count });
    }

    let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let mut spliced: Vec<&str> = Vec::with_capacity(line_count + 8);
    spliced.extend_from_slice(&lines[..start - 1]);
    spliced.extend(replacement.lines());
    spliced.extend_from_slice(&lines[end..]);

    let mut result = spliced.join(newline);
    if text.ends_with('\n') && !result.is_empty() {
        result.push_str(newline);
    }
    Ok(result)
}
