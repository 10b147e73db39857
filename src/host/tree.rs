//! Nesting of the flat recursive tree listing

use serde::{Deserialize, Serialize};

/// One entry of a recursive git tree listing.
#[derive(Debug, Clone, Deserialize)]
pub struct FlatEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    /// `blob` or `tree`
    #[serde(rename = "type")]
    pub kind: String,
    pub sha: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    /// A directory known only as a path prefix. `sha` and `url` stay empty
    /// until its own listing entry is seen.
    fn directory(name: &str, path: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            kind: "tree".to_string(),
            sha: String::new(),
            url: String::new(),
            children: Some(Vec::new()),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == "blob"
    }
}

/// Nest a flat listing into a forest, dropping every entry that has an
/// excluded folder anywhere in its path. Listing order is preserved;
/// directories that only appear as path prefixes are synthesized.
pub fn build_tree(entries: &[FlatEntry], excluded: &[String]) -> Vec<TreeNode> {
    let mut roots: Vec<TreeNode> = Vec::new();

    for entry in entries {
        let parts: Vec<&str> = entry.path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() || parts.iter().any(|p| excluded.iter().any(|e| e == p)) {
            continue;
        }

        let mut level = &mut roots;
        let mut current_path = String::new();
        for (i, part) in parts.iter().enumerate() {
            if !current_path.is_empty() {
                current_path.push('/');
            }
            current_path.push_str(part);
            let is_last = i == parts.len() - 1;

            let index = match level.iter().position(|n| n.name == *part) {
                Some(index) => {
                    let node = &mut level[index];
                    if is_last && entry.kind == "tree" && node.sha.is_empty() {
                        node.sha = entry.sha.clone();
                        node.url = entry.url.clone();
                    }
                    index
                }
                None => {
                    let node = if is_last {
                        TreeNode {
                            name: part.to_string(),
                            path: current_path.clone(),
                            kind: entry.kind.clone(),
                            sha: entry.sha.clone(),
                            url: entry.url.clone(),
                            children: (entry.kind == "tree").then(Vec::new),
                        }
                    } else {
                        TreeNode::directory(part, current_path.clone())
                    };
                    level.push(node);
                    level.len() - 1
                }
            };

            if is_last {
                break;
            }
            let node = &mut level[index];
            level = node.children.get_or_insert_with(Vec::new);
        }
    }

    roots
}

/// Paths of every file in the forest, depth-first.
pub fn file_paths(nodes: &[TreeNode]) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack: Vec<&TreeNode> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if node.is_file() {
            out.push(node.path.clone());
        }
        if let Some(children) = &node.children {
            stack.extend(children.iter().rev());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, kind: &str) -> FlatEntry {
        FlatEntry {
            path: path.to_string(),
            kind: kind.to_string(),
            sha: format!("sha-{}", path),
            url: format!("https://api.test/{}", path),
        }
    }

    fn default_excluded() -> Vec<String> {
        ["node_modules", ".git", "dist", "build", "coverage"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_nests_flat_listing() {
        let entries = vec![
            entry("src", "tree"),
            entry("src/App.jsx", "blob"),
            entry("src/components/Button.jsx", "blob"),
            entry("README.md", "blob"),
        ];
        let tree = build_tree(&entries, &default_excluded());

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].name, "src");
        assert_eq!(tree[0].kind, "tree");
        let src_children = tree[0].children.as_ref().unwrap();
        assert_eq!(src_children[0].path, "src/App.jsx");
        assert_eq!(src_children[1].name, "components");
        assert_eq!(src_children[1].kind, "tree");
        assert_eq!(
            src_children[1].children.as_ref().unwrap()[0].path,
            "src/components/Button.jsx"
        );
        assert!(tree[1].children.is_none());
    }

    #[test]
    fn test_synthesized_directory_does_not_borrow_child_identity() {
        let entries = vec![
            entry("lib/util.js", "blob"),
            entry("lib", "tree"),
            entry("docs/guide.md", "blob"),
        ];
        let tree = build_tree(&entries, &default_excluded());

        // `lib` is listed after its child, so its own entry fills it in.
        assert_eq!(tree[0].name, "lib");
        assert_eq!(tree[0].sha, "sha-lib");
        assert_eq!(tree[0].url, "https://api.test/lib");
        assert_eq!(tree[0].children.as_ref().unwrap()[0].sha, "sha-lib/util.js");

        // `docs` never appears on its own.
        assert_eq!(tree[1].name, "docs");
        assert_eq!(tree[1].kind, "tree");
        assert!(tree[1].sha.is_empty());
        assert!(tree[1].url.is_empty());
    }

    #[test]
    fn test_excluded_folders_are_pruned_at_any_depth() {
        let entries = vec![
            entry("node_modules/react/index.js", "blob"),
            entry("packages/web/dist/bundle.js", "blob"),
            entry("packages/web/src/index.js", "blob"),
            entry(".git/config", "blob"),
            entry("coverage", "tree"),
        ];
        let tree = build_tree(&entries, &default_excluded());
        assert_eq!(file_paths(&tree), vec!["packages/web/src/index.js"]);
    }

    #[test]
    fn test_exclusion_matches_whole_segments_only() {
        let entries = vec![entry("src/build_utils.js", "blob")];
        let tree = build_tree(&entries, &default_excluded());
        assert_eq!(file_paths(&tree), vec!["src/build_utils.js"]);
    }

    #[test]
    fn test_serializes_type_field() {
        let tree = build_tree(&[entry("a.js", "blob")], &[]);
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json[0]["type"], "blob");
        assert!(json[0].get("children").is_none());
    }

    #[test]
    fn test_flat_entry_parses_git_listing() {
        let json = r#"{"path": "src/a.js", "mode": "100644", "type": "blob", "sha": "abc", "size": 12, "url": "u"}"#;
        let parsed: FlatEntry = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, "blob");
        assert_eq!(parsed.sha, "abc");
    }
}
