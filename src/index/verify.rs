//! Syntax verification of edited content

use super::parser::parse_with_pooled_parser;
use super::Language;
use crate::error::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use tree_sitter::Node;

/// 1-based position of the most specific structural error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub ok: bool,
    pub locator: Option<Locator>,
}

impl Verification {
    fn valid() -> Self {
        Self {
            ok: true,
            locator: None,
        }
    }
}

/// Parse `content` and report whether the tree is free of error nodes.
///
/// An empty or declaration-free file is valid as long as it parses cleanly.
pub fn verify(content: &str, language: Language) -> AgentResult<Verification> {
    if !language.is_supported() {
        return Err(AgentError::UnsupportedLanguage(language.tag().to_string()));
    }

    let tree = parse_with_pooled_parser(content, language)?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(Verification::valid());
    }

    let offending = deepest_error_node(root);
    let position = offending.start_position();
    Ok(Verification {
        ok: false,
        locator: Some(Locator {
            line: position.row + 1,
            column: position.column + 1,
        }),
    })
}

/// Follow the left-most error-bearing child down to the deepest node that
/// still carries the error.
fn deepest_error_node(root: Node<'_>) -> Node<'_> {
    let mut node = root;
    loop {
        let mut cursor = node.walk();
        let next = node.children(&mut cursor).find(|child| child.has_error());
        match next {
            Some(child) => node = child,
            None => return node,
        }
    }
}
