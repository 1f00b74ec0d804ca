pub mod ai;
pub mod condition;
pub mod delay;
pub mod error_handler;
pub mod loop_node;
pub mod merge;
pub mod message;
pub mod parallel;
pub mod retry;
pub mod set_variable;
pub mod subflow;
pub mod switch;
pub mod swarm;
pub mod trigger;

use conduit_core::flow::Flow;
use conduit_core::result::NodeFailure;

/// The single node a wrapper guards: the target of its only default edge.
pub(crate) fn wrapped_target(flow: &Flow, wrapper_id: &str) -> Result<String, NodeFailure> {
    let targets: Vec<&str> = flow
        .outgoing(wrapper_id)
        .filter(|e| e.is_default())
        .map(|e| e.target.as_str())
        .collect();
    match targets.as_slice() {
        [target] => Ok(target.to_string()),
        [] => Err(NodeFailure::config(format!(
            "'{}' has no node to wrap",
            wrapper_id
        ))),
        _ => Err(NodeFailure::config(format!(
            "'{}' must wrap exactly one node, found {}",
            wrapper_id,
            targets.len()
        ))),
    }
}

/// Read a list of strings from a config value, ignoring non-strings.
pub(crate) fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
