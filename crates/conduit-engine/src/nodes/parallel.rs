use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::info;

use conduit_core::flow::Flow;
use conduit_core::result::{Next, NodeFailure, NodeResult};

use crate::board::BranchBoard;
use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;
use crate::parallel::{Branch, ForkJoinManager, ForkPlan, JoinMode};

/// Handle of the edge a fork continues on when it has no paired merge.
pub const DONE_HANDLE: &str = "done";

/// Fan-out branches of a fork node in edge declaration order.
///
/// Every outgoing edge except `done` starts a branch. Branch names come from
/// `branchNames`, then the edge label, then the target id.
pub fn fork_branches(flow: &Flow, fork_id: &str, names: Option<&Map<String, Value>>) -> Vec<Branch> {
    flow.outgoing(fork_id)
        .filter(|e| e.handle() != DONE_HANDLE)
        .map(|e| {
            let name = names
                .and_then(|m| m.get(&e.target))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| (!e.is_default()).then(|| e.handle().to_string()))
                .unwrap_or_else(|| e.target.clone());
            Branch {
                name,
                start: e.target.clone(),
            }
        })
        .collect()
}

/// Fork node: runs its outgoing branches concurrently under a join policy.
pub struct ParallelExecutor;

impl NodeExecutor for ParallelExecutor {
    fn node_type(&self) -> &str {
        "logic:parallel"
    }

    fn description(&self) -> &str {
        "Runs outgoing branches concurrently and joins them"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(mode) = config.get("mode").and_then(|v| v.as_str()) {
            if JoinMode::parse(mode).is_none() {
                errors.push(format!("unknown mode '{}'", mode));
            }
        }
        if let Some(names) = config.get("branchNames") {
            if !names.is_object() {
                errors.push("branchNames must be an object of nodeId -> name".to_string());
            }
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let defaults = &ctx.engine.config().parallel;
            let mode = ctx
                .param_str("mode")
                .and_then(JoinMode::parse)
                .unwrap_or_default();
            let branch_timeout_ms = ctx
                .param_u64("branchTimeoutMs")
                .unwrap_or(defaults.branch_timeout_ms);
            let merge_id = ctx.param_str("mergeNodeId").map(str::to_string);

            let branches = fork_branches(
                &ctx.flow,
                &ctx.node.id,
                ctx.param("branchNames").and_then(|v| v.as_object()),
            );
            if branches.len() < 2 {
                return NodeResult::failure(NodeFailure::config(format!(
                    "parallel node '{}' needs at least 2 branches, found {}",
                    ctx.node.id,
                    branches.len()
                )));
            }

            let board = match &merge_id {
                Some(id) => {
                    if ctx.flow.node(id).is_none() {
                        return NodeResult::failure(NodeFailure::config(format!(
                            "mergeNodeId '{}' does not exist",
                            id
                        )));
                    }
                    let board = Arc::new(BranchBoard::new(
                        branches.iter().map(|b| b.name.clone()).collect(),
                    ));
                    ctx.open_board(id, board.clone());
                    Some(board)
                }
                None => None,
            };

            let plan = ForkPlan {
                mode,
                continue_on_error: ctx.param_bool("continueOnError").unwrap_or(false),
                max_concurrency: ctx
                    .param_u64("maxConcurrency")
                    .map(|n| n as usize)
                    .unwrap_or(defaults.max_concurrency),
                branch_timeout: (branch_timeout_ms > 0)
                    .then(|| Duration::from_millis(branch_timeout_ms)),
                stop_at: merge_id.clone(),
                board,
            };

            info!(
                execution_id = %ctx.execution_id,
                node_id = %ctx.node.id,
                branches = branches.len(),
                mode = ?mode,
                "Fork started"
            );
            let total = branches.len();
            let outcome = ForkJoinManager::run(&ctx, branches, plan).await;

            if outcome.cancelled {
                return NodeResult::failure(NodeFailure::aborted());
            }
            if let Some(failure) = outcome.failure {
                return NodeResult::failure(failure);
            }

            let results: Map<String, Value> = outcome.results.iter().cloned().collect();
            let errors: Map<String, Value> = outcome
                .errors
                .iter()
                .map(|(name, f)| (name.clone(), f.to_json()))
                .collect();
            let output = json!({
                "mode": mode,
                "results": results,
                "errors": errors,
                "total": total,
                "completed": outcome.results.len() + outcome.errors.len(),
                "succeeded": outcome.results.len(),
                "failed": outcome.errors.len(),
                "winner": outcome.winner,
            });

            let next = match merge_id {
                Some(id) => Next::Node(id),
                None if ctx.flow.edge_for_handle(&ctx.node.id, DONE_HANDLE).is_some() => {
                    Next::Handle(DONE_HANDLE.to_string())
                }
                None => Next::Halt,
            };
            NodeResult::route(output, next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::flow::{Edge, Node};

    #[test]
    fn branch_naming_and_done_edge() {
        let flow = Flow {
            nodes: vec![
                Node::new("fork", "logic:parallel"),
                Node::new("a", "logic:delay"),
                Node::new("b", "logic:delay"),
                Node::new("c", "logic:delay"),
                Node::new("after", "logic:delay"),
            ],
            edges: vec![
                Edge::new("fork", "a"),
                Edge::labeled("fork", "b", "billing"),
                Edge::new("fork", "c"),
                Edge::labeled("fork", "after", DONE_HANDLE),
            ],
            ..Default::default()
        };
        let names = json!({"c": "crm"});
        let branches = fork_branches(&flow, "fork", names.as_object());
        let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["a", "billing", "crm"]);
    }

    #[test]
    fn validation_rejects_unknown_mode() {
        assert_eq!(ParallelExecutor.validate(&json!({"mode": "some"})).len(), 1);
        assert!(ParallelExecutor.validate(&json!({"mode": "settled"})).is_empty());
    }
}
