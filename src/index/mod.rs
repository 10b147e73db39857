//! Structural indexing for editflow
//!
//! Uses tree-sitter to reduce a source file to a flat, line-addressable
//! list of declarations, and to judge whether edited content still parses.

pub mod parser;
pub mod verify;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use parser::extract;
pub use verify::{verify, Locator, Verification};

/// Languages with a registered structural parser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    JavaScript,
    TypeScript,
    Tsx,
    Python,
    Rust,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "mts" | "cts" => Language::TypeScript,
            "tsx" => Language::Tsx,
            "py" | "pyi" => Language::Python,
            "rs" => Language::Rust,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    /// Resolve the language tag for a repository path (`src/App.tsx` -> `Tsx`).
    pub fn from_path(path: &str) -> Self {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Unknown)
    }

    /// Inverse of [`Language::tag`]; file extensions are accepted too.
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "javascript" => Language::JavaScript,
            "typescript" => Language::TypeScript,
            "python" => Language::Python,
            "rust" => Language::Rust,
            "go" => Language::Go,
            other => Language::from_extension(other),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Tsx => "tsx",
            Language::Python => "python",
            Language::Rust => "rust",
            Language::Go => "go",
            Language::Unknown => "unknown",
        }
    }

    pub fn is_supported(&self) -> bool {
        *self != Language::Unknown
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Structural category of an extracted declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    Function,
    Class,
    Method,
    Binding,
    MarkupElement,
}

impl DeclarationKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeclarationKind::Function => "function",
            DeclarationKind::Class => "class",
            DeclarationKind::Method => "method",
            DeclarationKind::Binding => "binding",
            DeclarationKind::MarkupElement => "markup_element",
        }
    }
}

/// A structural unit extracted from one file.
///
/// Lines are 1-based and inclusive. Declarations are re-derived on every
/// extraction and carry no identity across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub kind: DeclarationKind,
    /// Grammar node kind the declaration came from (e.g. `lexical_declaration`)
    pub node_kind: String,
    /// Empty when the construct is anonymous
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub code: String,
}

impl Declaration {
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}
