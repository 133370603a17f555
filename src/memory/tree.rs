//! Portable tree document shared by export and import.

use serde::{Deserialize, Serialize};

use super::error::{GraphError, Result};

pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDocument {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub exported_at: String,
    pub root_nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub observations: Vec<TreeObservation>,
    /// Type of the relation linking this node to its tree parent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<String>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeObservation {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl TreeNode {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            aliases: None,
            description: None,
            observations: Vec::new(),
            relation_type: None,
            children: Vec::new(),
        }
    }

    /// This node plus all of its descendants.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::node_count).sum::<usize>()
    }
}

impl TreeDocument {
    pub fn node_count(&self) -> usize {
        self.root_nodes.iter().map(TreeNode::node_count).sum()
    }
}

pub fn root_path(index: usize) -> String {
    index.to_string()
}

/// Dotted path of the `index`-th child under `parent`, e.g. `0.children.2`.
pub fn child_path(parent: &str, index: usize) -> String {
    format!("{}.children.{}", parent, index)
}

/// Parse an import document; anything without a `root_nodes` array is rejected.
pub fn parse_document(json: &str) -> Result<TreeDocument> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| GraphError::validation(format!("Import document is not valid JSON: {}", e)))?;
    parse_document_value(value)
}

pub fn parse_document_value(value: serde_json::Value) -> Result<TreeDocument> {
    if !value.get("root_nodes").is_some_and(|v| v.is_array()) {
        return Err(GraphError::validation(
            "Import document must contain a root_nodes array",
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| GraphError::validation(format!("Malformed import document: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_missing_root_nodes() {
        assert!(matches!(
            parse_document(r#"{"version": "1.0"}"#),
            Err(GraphError::ValidationFailed(_))
        ));
        assert!(matches!(
            parse_document(r#"{"root_nodes": {}}"#),
            Err(GraphError::ValidationFailed(_))
        ));
        assert!(matches!(parse_document("not json"), Err(GraphError::ValidationFailed(_))));
    }

    #[test]
    fn test_parses_minimal_nodes() {
        let doc = parse_document(
            r#"{"root_nodes": [{"name": "P", "entity_type": "Project",
                "children": [{"name": "C", "entity_type": "Module", "relation_type": "depends_on",
                              "observations": [{"content": "hello"}]}]}]}"#,
        )
        .unwrap();
        assert_eq!(doc.node_count(), 2);
        let child = &doc.root_nodes[0].children[0];
        assert_eq!(child.relation_type.as_deref(), Some("depends_on"));
        assert_eq!(child.observations[0].content, "hello");
        assert_eq!(child.observations[0].created_at, None);
    }

    #[test]
    fn test_paths() {
        assert_eq!(child_path(&child_path(&root_path(0), 2), 0), "0.children.2.children.0");
    }
}
