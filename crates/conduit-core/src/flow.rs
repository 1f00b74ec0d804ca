use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConduitError, Result};

/// Handle name used by edges that carry no explicit label.
pub const DEFAULT_HANDLE: &str = "default";

/// A named graph of nodes and edges.
///
/// Immutable once loaded for a run. The same definition is shared (via `Arc`)
/// by every context derived during that run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Declared variable namespace with initial values.
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
}

/// A node is pure data: `type` selects the executor, `data` is its configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data: Value::Object(Default::default()),
        }
    }

    /// Set the node configuration.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Category prefix of the node type (`logic` for `logic:retry`).
    pub fn category(&self) -> &str {
        self.node_type
            .split_once(':')
            .map(|(category, _)| category)
            .unwrap_or("")
    }
}

/// A directed edge, optionally labeled with an output-handle name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, alias = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    /// Create an unlabeled edge.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    /// Create an edge leaving a named output handle.
    pub fn labeled(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: Some(label.into()),
        }
    }

    /// The handle this edge leaves from.
    pub fn handle(&self) -> &str {
        self.label.as_deref().unwrap_or(DEFAULT_HANDLE)
    }

    pub fn is_default(&self) -> bool {
        self.handle() == DEFAULT_HANDLE
    }
}

impl Flow {
    /// Parse a flow definition from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a node, failing with `NodeNotFound`.
    pub fn require_node(&self, id: &str) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| ConduitError::NodeNotFound(id.to_string()))
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing<'a, 'b>(&'a self, id: &'b str) -> impl Iterator<Item = &'a Edge> + 'b
    where
        'a: 'b,
    {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn has_outgoing(&self, id: &str) -> bool {
        self.outgoing(id).next().is_some()
    }

    /// First edge leaving the given handle of a node.
    pub fn edge_for_handle(&self, id: &str, handle: &str) -> Option<&Edge> {
        self.outgoing(id).find(|e| e.handle() == handle)
    }

    /// The edge an ordinary node follows when its result carries no routing override:
    /// the first unlabeled (or `default`) edge. Labeled edges are only taken by handle.
    pub fn default_edge(&self, id: &str) -> Option<&Edge> {
        self.outgoing(id).find(|e| e.is_default())
    }

    /// Number of edges pointing at a node.
    pub fn incoming_count(&self, id: &str) -> usize {
        self.edges.iter().filter(|e| e.target == id).count()
    }

    /// Entry node: the first trigger node, else the first node without incoming edges.
    pub fn entry_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.category() == "trigger")
            .or_else(|| self.nodes.iter().find(|n| self.incoming_count(&n.id) == 0))
    }

    /// Structural problems independent of node types: duplicate ids, dangling edges,
    /// and a missing entry node.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                errors.push(format!("duplicate node id '{}'", node.id));
            }
        }
        for edge in &self.edges {
            if self.node(&edge.source).is_none() {
                errors.push(format!("edge source '{}' does not exist", edge.source));
            }
            if self.node(&edge.target).is_none() {
                errors.push(format!("edge target '{}' does not exist", edge.target));
            }
        }
        if self.entry_node().is_none() {
            errors.push("flow has no entry node".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Flow {
        Flow::from_json(
            r#"{
                "id": "greet",
                "nodes": [
                    {"id": "start", "type": "trigger:manual"},
                    {"id": "check", "type": "logic:condition", "data": {"operator": ">"}},
                    {"id": "yes", "type": "logic:set_variable"},
                    {"id": "no", "type": "logic:set_variable"}
                ],
                "edges": [
                    {"source": "start", "target": "check"},
                    {"source": "check", "target": "yes", "label": "true"},
                    {"source": "check", "target": "no", "sourceHandle": "false"}
                ],
                "variables": {"count": 0}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_definition_format() {
        let flow = sample();
        assert_eq!(flow.nodes.len(), 4);
        assert_eq!(flow.edges[2].label.as_deref(), Some("false"));
        assert_eq!(flow.variables.get("count"), Some(&serde_json::json!(0)));
        assert_eq!(flow.node("check").unwrap().category(), "logic");
    }

    #[test]
    fn handle_lookup() {
        let flow = sample();
        assert_eq!(flow.edge_for_handle("check", "false").unwrap().target, "no");
        assert!(flow.edge_for_handle("check", "maybe").is_none());
        assert_eq!(flow.default_edge("start").unwrap().target, "check");
        // Only labeled edges: nothing to follow without a handle.
        assert!(flow.default_edge("check").is_none());
        assert!(flow.default_edge("yes").is_none());
    }

    #[test]
    fn entry_prefers_trigger() {
        let flow = sample();
        assert_eq!(flow.entry_node().unwrap().id, "start");

        let headless = Flow {
            nodes: vec![Node::new("a", "logic:delay"), Node::new("b", "logic:delay")],
            edges: vec![Edge::new("a", "b")],
            ..Default::default()
        };
        assert_eq!(headless.entry_node().unwrap().id, "a");
    }

    #[test]
    fn structural_errors_reported() {
        let flow = Flow {
            nodes: vec![Node::new("a", "trigger:manual"), Node::new("a", "logic:delay")],
            edges: vec![Edge::new("a", "ghost")],
            ..Default::default()
        };
        let errors = flow.structural_errors();
        assert!(errors.iter().any(|e| e.contains("duplicate node id 'a'")));
        assert!(errors.iter().any(|e| e.contains("'ghost'")));
    }
}
