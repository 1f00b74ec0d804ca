use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conduit_core::result::{ErrorKind, NodeFailure};
use conduit_core::types::{ExecutionId, NodeState, RunStatus};

/// One entry of a run's per-node trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub node_type: String,
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeFailure>,
    pub elapsed_ms: u64,
}

/// Structured failure reported for a run or path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub node_id: String,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RunFailure {
    pub fn new(node_id: impl Into<String>, failure: &NodeFailure) -> Self {
        Self {
            node_id: node_id.into(),
            kind: failure.kind,
            message: failure.message.clone(),
            code: failure.code.clone(),
        }
    }

    /// Back to a node-level failure, e.g. when a wrapper propagates a path failure.
    pub fn to_node_failure(&self) -> NodeFailure {
        let mut failure = NodeFailure::new(self.kind, self.message.clone());
        failure.code = self.code.clone();
        failure
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node '{}' failed: [{}] {}", self.node_id, self.kind, self.message)
    }
}

/// How one walked path ended.
#[derive(Debug, Clone)]
pub enum PathOutcome {
    /// Reached a node with no onward edge (or the stop node). Carries the last output.
    Completed { output: Value },
    Failed(RunFailure),
    Cancelled,
}

impl PathOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Result of executing an entire flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub flow_id: String,
    pub status: RunStatus,
    /// Output of the last node on the main path.
    pub output: Value,
    /// Per-node results in execution order.
    pub node_records: Vec<NodeRecord>,
    /// Final variable values.
    pub variables: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Records for a node, in execution order.
    pub fn records_for<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a NodeRecord> + 'b
    where
        'a: 'b,
    {
        self.node_records.iter().filter(move |r| r.node_id == node_id)
    }

    /// Last recorded output of a node.
    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.records_for(node_id).filter_map(|r| r.output.as_ref()).last()
    }

    pub fn executed(&self, node_id: &str) -> bool {
        self.records_for(node_id).next().is_some()
    }
}
