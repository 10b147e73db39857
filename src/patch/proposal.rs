//! Boundary decoding of the proposal document
//!
//! Generators return loosely formatted JSON (often fenced in markdown, and
//! sometimes wrapped in a `{"message": "..."}` envelope). It is decoded once
//! here into a typed [`Proposal`]; nothing past this module sees raw JSON.

use super::Edit;
use crate::error::{AgentError, AgentResult};
use crate::util::truncate;
use serde::Deserialize;

const DEFAULT_DESCRIPTION: &str = "Apply the requested changes";

/// A decoded proposal: a description of the change plus its edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub description: String,
    pub edits: Vec<Edit>,
}

#[derive(Debug, Deserialize)]
struct ProposalDocument {
    #[serde(default)]
    pr_description: Option<String>,
    changes: Vec<ChangeRecord>,
}

#[derive(Debug, Deserialize)]
struct ChangeRecord {
    #[serde(default)]
    is_new_file: bool,
    file_path: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    start_line: Option<i64>,
    #[serde(default)]
    end_line: Option<i64>,
    #[serde(default)]
    new_code: String,
}

impl ChangeRecord {
    fn into_edit(self) -> AgentResult<Edit> {
        let action = self.action.as_deref().unwrap_or("replace");
        if self.is_new_file || action == "create" {
            return Ok(Edit::Create {
                path: self.file_path,
                content: self.new_code,
            });
        }
        if action != "replace" {
            return Err(AgentError::ProposalMalformed(format!(
                "unsupported action '{}' for {}",
                action, self.file_path
            )));
        }
        // Missing or negative line numbers become line 0, which is always out
        // of bounds and therefore skipped when the edit is applied.
        Ok(Edit::Replace {
            path: self.file_path,
            start_line: line_number(self.start_line),
            end_line: line_number(self.end_line),
            content: self.new_code,
        })
    }
}

fn line_number(raw: Option<i64>) -> usize {
    raw.and_then(|n| usize::try_from(n).ok()).unwrap_or(0)
}

impl Proposal {
    /// Decode a raw generator response.
    pub fn decode(raw: &str) -> AgentResult<Self> {
        let body = unwrap_message_envelope(raw);
        let clean = strip_markdown_fences(&body);
        if clean.is_empty() {
            return Err(AgentError::ProposalMalformed(
                "the generator returned an empty document".to_string(),
            ));
        }

        let json = extract_json_fragment(clean, '{', '}').unwrap_or(clean);
        let document: ProposalDocument = serde_json::from_str(json).map_err(|e| {
            AgentError::ProposalMalformed(format!("{} (preview: {})", e, truncate(json, 200)))
        })?;

        let edits = document
            .changes
            .into_iter()
            .map(ChangeRecord::into_edit)
            .collect::<AgentResult<Vec<_>>>()?;

        let description = document
            .pr_description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());

        Ok(Self { description, edits })
    }
}

/// Some generators nest the document as a string under `message`.
fn unwrap_message_envelope(raw: &str) -> String {
    if let Ok(serde_json::Value::Object(outer)) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Some(serde_json::Value::String(inner)) = outer.get("message") {
            return inner.clone();
        }
    }
    raw.to_string()
}

/// Strip markdown code fences from a response
pub(crate) fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
pub(crate) fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}
