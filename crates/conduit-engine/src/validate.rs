use std::collections::{HashSet, VecDeque};

use conduit_core::flow::Flow;

use crate::executor::ExecutorRegistry;
use crate::nodes::error_handler::ERROR_HANDLE;
use crate::nodes::parallel::fork_branches;
use crate::nodes::retry::FALLBACK_HANDLE;
use crate::nodes::wrapped_target;
use crate::parallel::Branch;

/// Check a whole flow before it runs.
///
/// Combines structural problems, unknown node types, each executor's own
/// `validate`, and the cross-node rules of forks, merges and wrappers.
/// Messages are prefixed with the offending node id.
pub fn validate_flow(flow: &Flow, registry: &ExecutorRegistry) -> Vec<String> {
    let mut errors = flow.structural_errors();

    for node in &flow.nodes {
        let Some(executor) = registry.get(&node.node_type) else {
            errors.push(format!("{}: unknown node type '{}'", node.id, node.node_type));
            continue;
        };
        errors.extend(
            executor
                .validate(&node.data)
                .into_iter()
                .map(|e| format!("{}: {}", node.id, e)),
        );

        let str_field = |key: &str| node.data.get(key).and_then(|v| v.as_str());
        match node.node_type.as_str() {
            "logic:parallel" => {
                let names = node.data.get("branchNames").and_then(|v| v.as_object());
                let branches = fork_branches(flow, &node.id, names);
                if branches.len() < 2 {
                    errors.push(format!(
                        "{}: a fork requires at least 2 branches, found {}",
                        node.id,
                        branches.len()
                    ));
                }
                if let Some(merge_id) = str_field("mergeNodeId") {
                    match flow.node(merge_id) {
                        None => errors.push(format!(
                            "{}: mergeNodeId '{}' does not exist",
                            node.id, merge_id
                        )),
                        Some(merge) if merge.node_type != "logic:merge" => errors.push(format!(
                            "{}: mergeNodeId '{}' is not a merge node",
                            node.id, merge_id
                        )),
                        Some(merge) => {
                            if let Some(expected) =
                                merge.data.get("expectedBranches").and_then(|v| v.as_u64())
                            {
                                if expected as usize != branches.len() {
                                    errors.push(format!(
                                        "{}: expectedBranches {} does not match the {} branches of '{}'",
                                        merge_id,
                                        expected,
                                        branches.len(),
                                        node.id
                                    ));
                                }
                            }
                        }
                    }
                } else if let Some(merge_id) = reachable_merge(flow, &node.id, &branches) {
                    errors.push(format!(
                        "{}: branches reach merge '{}' but mergeNodeId is not set",
                        node.id, merge_id
                    ));
                }
            }
            "logic:retry" | "logic:error_handler" => {
                if let Err(f) = wrapped_target(flow, &node.id) {
                    errors.push(format!("{}: {}", node.id, f.message));
                }
                let needs_branch = match node.node_type.as_str() {
                    "logic:retry" => (str_field("onFinalFailure") == Some("fallback")).then_some(FALLBACK_HANDLE),
                    _ => (str_field("onError") == Some("route")).then_some(ERROR_HANDLE),
                };
                if let Some(handle) = needs_branch {
                    if flow.edge_for_handle(&node.id, handle).is_none() {
                        errors.push(format!("{}: no '{}' edge to route to", node.id, handle));
                    }
                }
            }
            _ => {}
        }
    }

    errors
}

/// First merge node reachable from a fork's branches, without passing back
/// through the fork.
fn reachable_merge(flow: &Flow, fork_id: &str, branches: &[Branch]) -> Option<String> {
    let mut seen: HashSet<&str> = HashSet::from([fork_id]);
    let mut queue: VecDeque<&str> = branches.iter().map(|b| b.start.as_str()).collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(node) = flow.node(id) else {
            continue;
        };
        if node.node_type == "logic:merge" {
            return Some(node.id.clone());
        }
        queue.extend(flow.outgoing(id).map(|e| e.target.as_str()));
    }
    None
}
