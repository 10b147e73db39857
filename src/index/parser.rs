//! Tree-sitter based declaration extraction

use super::{Declaration, DeclarationKind, Language};
use crate::error::{AgentError, AgentResult};
use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════
//
// Tree-sitter parsers are expensive to create but can be reused for multiple
// files of the same language. Each runtime worker thread gets its own set of
// pre-configured parsers.

thread_local! {
    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

/// Parse content using a thread-local parser for the given language
pub(crate) fn parse_with_pooled_parser(content: &str, language: Language) -> AgentResult<Tree> {
    let parse_result = match language {
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => TS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Tsx => TSX_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => None,
    };

    // A pooled parser whose grammar failed to load parses to None as well.
    parse_result.ok_or_else(|| AgentError::UnsupportedLanguage(language.tag().to_string()))
}

/// Extract every declaration in `content`, outer before inner.
///
/// Nested declarations (a method inside a class, a JSX element inside a
/// component) are emitted as separate entries in pre-order; no parent links
/// are kept.
pub fn extract(content: &str, language: Language) -> AgentResult<Vec<Declaration>> {
    if !language.is_supported() {
        return Err(AgentError::UnsupportedLanguage(language.tag().to_string()));
    }

    let tree = parse_with_pooled_parser(content, language)?;
    let bytes = content.as_bytes();
    let lines = LineTable::new(bytes);

    let mut declarations = Vec::new();
    let mut cursor = tree.root_node().walk();

    loop {
        let node = cursor.node();

        if let Some(kind) = classify(language, &node) {
            let start = node.start_byte();
            let end = node.end_byte();
            declarations.push(Declaration {
                kind,
                node_kind: node.kind().to_string(),
                name: declaration_name(&node, bytes),
                start_line: lines.line_of(start),
                // Map the last byte the node covers, not the exclusive end.
                end_line: lines.line_of(end.saturating_sub(1).max(start)),
                code: String::from_utf8_lossy(&bytes[start..end]).into_owned(),
            });
        }

        if cursor.goto_first_child() {
            continue;
        }

        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return Ok(declarations);
            }
        }
    }
}

/// Byte offsets at which each line begins, ascending.
pub(crate) struct LineTable {
    starts: Vec<usize>,
}

impl LineTable {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        let mut starts = vec![0];
        starts.extend(
            bytes
                .iter()
                .enumerate()
                .filter(|(_, b)| **b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { starts }
    }

    /// 1-based line containing `offset`.
    pub(crate) fn line_of(&self, offset: usize) -> usize {
        // starts[0] == 0, so the count is always >= 1
        self.starts.partition_point(|&start| start <= offset)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.starts.len()
    }
}

fn classify(language: Language, node: &Node) -> Option<DeclarationKind> {
    // Keyword tokens such as `function` or `lambda` share their kind string
    // with no named node, so anonymous nodes are never declarations.
    if !node.is_named() {
        return None;
    }
    let kind = node.kind();
    match language {
        Language::JavaScript | Language::TypeScript | Language::Tsx => match kind {
            "function_declaration"
            | "generator_function_declaration"
            | "function_expression"
            | "arrow_function" => Some(DeclarationKind::Function),
            "method_definition" => Some(DeclarationKind::Method),
            "class_declaration" | "abstract_class_declaration" => Some(DeclarationKind::Class),
            "variable_declaration" | "lexical_declaration" => Some(DeclarationKind::Binding),
            "jsx_element" | "jsx_self_closing_element" => Some(DeclarationKind::MarkupElement),
            _ => None,
        },
        Language::Python => match kind {
            "function_definition" if has_ancestor(node, "class_definition", 3) => {
                Some(DeclarationKind::Method)
            }
            "function_definition" | "lambda" => Some(DeclarationKind::Function),
            "class_definition" => Some(DeclarationKind::Class),
            "assignment" if parent_kind(node) == Some("expression_statement") => {
                Some(DeclarationKind::Binding)
            }
            _ => None,
        },
        Language::Rust => match kind {
            "function_item" if parent_kind(node) == Some("declaration_list") => {
                Some(DeclarationKind::Method)
            }
            "function_item" | "closure_expression" => Some(DeclarationKind::Function),
            "struct_item" | "enum_item" | "union_item" | "trait_item" | "impl_item" => {
                Some(DeclarationKind::Class)
            }
            "let_declaration" | "const_item" | "static_item" => Some(DeclarationKind::Binding),
            _ => None,
        },
        Language::Go => match kind {
            "function_declaration" | "func_literal" => Some(DeclarationKind::Function),
            "method_declaration" => Some(DeclarationKind::Method),
            "type_declaration" => Some(DeclarationKind::Class),
            "var_declaration" | "const_declaration" | "short_var_declaration" => {
                Some(DeclarationKind::Binding)
            }
            _ => None,
        },
        Language::Unknown => None,
    }
}

fn parent_kind(node: &Node) -> Option<&'static str> {
    node.parent().map(|p| p.kind())
}

fn has_ancestor(node: &Node, kind: &str, max_hops: usize) -> bool {
    let mut current = node.parent();
    for _ in 0..max_hops {
        match current {
            Some(n) if n.kind() == kind => return true,
            Some(n) => current = n.parent(),
            None => return false,
        }
    }
    false
}

fn node_text(node: &Node, bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[node.start_byte()..node.end_byte()]).into_owned()
}

fn field_text(node: &Node, field: &str, bytes: &[u8]) -> Option<String> {
    node.child_by_field_name(field).map(|n| node_text(&n, bytes))
}

fn first_named_child_of_kind<'t>(node: &Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node
        .named_children(&mut cursor)
        .find(|child| child.kind() == kind);
    found
}

fn declaration_name(node: &Node, bytes: &[u8]) -> String {
    if let Some(name) = field_text(node, "name", bytes) {
        return name;
    }

    match node.kind() {
        "variable_declaration" | "lexical_declaration" => {
            let declarator = node
                .child_by_field_name("declarator")
                .or_else(|| node.named_child(0));
            declarator
                .map(|d| field_text(&d, "name", bytes).unwrap_or_else(|| node_text(&d, bytes)))
                .unwrap_or_default()
        }
        "jsx_element" => first_named_child_of_kind(node, "jsx_opening_element")
            .and_then(|opening| {
                opening
                    .child_by_field_name("name")
                    .or_else(|| opening.named_child(0))
            })
            .map(|tag| node_text(&tag, bytes))
            .unwrap_or_default(),
        "jsx_self_closing_element" => node
            .named_child(0)
            .map(|tag| node_text(&tag, bytes))
            .unwrap_or_default(),
        "assignment" | "short_var_declaration" => {
            field_text(node, "left", bytes).unwrap_or_default()
        }
        "let_declaration" => field_text(node, "pattern", bytes).unwrap_or_default(),
        "impl_item" => field_text(node, "type", bytes).unwrap_or_default(),
        "type_declaration" | "var_declaration" | "const_declaration" => node
            .named_child(0)
            .and_then(|spec| field_text(&spec, "name", bytes))
            .unwrap_or_default(),
        "arrow_function" | "function_expression" | "lambda"
        | "closure_expression" | "func_literal" => bound_name(node, bytes),
        _ => String::new(),
    }
}

/// Name of the binding an anonymous function is assigned to, if any.
fn bound_name(node: &Node, bytes: &[u8]) -> String {
    let Some(parent) = node.parent() else {
        return String::new();
    };
    let field = match parent.kind() {
        "variable_declarator" => "name",
        "assignment" | "assignment_expression" => "left",
        "let_declaration" => "pattern",
        "pair" => "key",
        _ => return String::new(),
    };
    field_text(&parent, field, bytes).unwrap_or_default()
}
