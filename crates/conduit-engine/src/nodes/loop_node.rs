use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use conduit_core::result::{ErrorKind, Next, NodeFailure, NodeResult};

use crate::context::{value_as_u64, ExecutionContext};
use crate::executor::NodeExecutor;
use crate::nodes::condition::evaluate_clause;
use crate::nodes::parallel::DONE_HANDLE;
use crate::report::PathOutcome;

/// Handle of the edge that starts the loop body.
pub const BODY_HANDLE: &str = "loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopType {
    ForEach,
    Count,
    While,
}

fn parse_type(s: &str) -> Option<LoopType> {
    match s {
        "forEach" => Some(LoopType::ForEach),
        "count" => Some(LoopType::Count),
        "while" => Some(LoopType::While),
        _ => None,
    }
}

/// Items a `forEach` loop iterates. Objects become `[key, value]` pairs.
pub fn loop_items(source: &Value) -> Result<Vec<Value>, String> {
    match source {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect()),
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        other => Err(format!(
            "arraySource must resolve to an array or object, got {}",
            other
        )),
    }
}

/// Repeats the path behind its `loop` edge, then continues on `done`.
///
/// The body path ends where it leads back to the loop node or runs out of
/// edges. `forEach` and `count` stop at `maxIterations` and mark the output
/// truncated; a `while` loop that reaches it fails.
pub struct LoopExecutor;

impl NodeExecutor for LoopExecutor {
    fn node_type(&self) -> &str {
        "logic:loop"
    }

    fn description(&self) -> &str {
        "Iterates over items, a count, or while a condition holds"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        match config.get("loopType").and_then(|v| v.as_str()).map(parse_type) {
            None => errors.push("loopType is required".to_string()),
            Some(None) => errors.push("loopType must be forEach, count or while".to_string()),
            Some(Some(LoopType::ForEach)) if config.get("arraySource").is_none() => {
                errors.push("arraySource is required for forEach".to_string())
            }
            Some(Some(LoopType::Count)) if config.get("count").is_none() => {
                errors.push("count is required for count loops".to_string())
            }
            Some(Some(LoopType::While)) if !config.get("condition").is_some_and(|c| c.is_object()) => {
                errors.push("condition object is required for while loops".to_string())
            }
            _ => {}
        }
        if let Some(max) = config.get("maxIterations") {
            if value_as_u64(max).map_or(true, |n| n == 0) {
                errors.push("maxIterations must be a positive integer".to_string());
            }
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let Some(loop_type) = ctx.param_str("loopType").and_then(parse_type) else {
                return NodeResult::failure(NodeFailure::config("loopType must be forEach, count or while"));
            };
            let max_iterations = ctx
                .param_u64("maxIterations")
                .map(|n| n as usize)
                .unwrap_or(ctx.engine.config().engine.max_iterations);
            let item_var = ctx.param_str("itemVariable").unwrap_or("item").to_string();
            let index_var = ctx.param_str("indexVariable").unwrap_or("index").to_string();
            let continue_on_error = ctx.param_bool("continueOnError").unwrap_or(false);

            let body = ctx
                .flow
                .edge_for_handle(&ctx.node.id, BODY_HANDLE)
                .map(|e| e.target.clone());

            let (items, truncated) = match loop_type {
                LoopType::ForEach => {
                    let source = ctx.param("arraySource").cloned().unwrap_or(Value::Null);
                    match loop_items(&source) {
                        Ok(mut items) => {
                            let truncated = items.len() > max_iterations;
                            items.truncate(max_iterations);
                            (Some(items), truncated)
                        }
                        Err(e) => return NodeResult::failure(NodeFailure::config(e)),
                    }
                }
                LoopType::Count => {
                    let count = ctx.param_u64("count").unwrap_or(0) as usize;
                    let n = count.min(max_iterations);
                    (Some((0..n).map(|i| json!(i)).collect()), count > max_iterations)
                }
                LoopType::While => (None, false),
            };
            if truncated {
                warn!(node_id = %ctx.node.id, max_iterations, "Loop source truncated");
            }

            let mut results = Vec::new();
            let mut errors = Vec::new();
            let mut index = 0usize;

            loop {
                let item = match &items {
                    Some(items) => match items.get(index) {
                        Some(item) => item.clone(),
                        None => break,
                    },
                    None => {
                        // Raw condition, re-resolved against the current state.
                        let condition = ctx
                            .raw_config()
                            .get("condition")
                            .map(|c| ctx.resolve(c))
                            .unwrap_or(Value::Null);
                        match evaluate_clause(&condition) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => return NodeResult::failure(NodeFailure::config(e)),
                        }
                        if index >= max_iterations {
                            return NodeResult::failure(NodeFailure::new(
                                ErrorKind::MaxIterationsExceeded,
                                format!("while loop '{}' exceeded {} iterations", ctx.node.id, max_iterations),
                            ));
                        }
                        json!(index)
                    }
                };

                ctx.variables.set(item_var.clone(), item);
                ctx.variables.set(index_var.clone(), json!(index));
                debug!(node_id = %ctx.node.id, index, "Loop iteration");

                if let Some(start) = &body {
                    match ctx.engine.run_path(&ctx, start, Some(&ctx.node.id)).await {
                        PathOutcome::Completed { output } => results.push(output),
                        PathOutcome::Cancelled => return NodeResult::failure(NodeFailure::aborted()),
                        PathOutcome::Failed(f) => {
                            if !continue_on_error || f.kind.is_safety_limit() {
                                let mut failure = f.to_node_failure();
                                failure.message = format!("iteration {} failed at '{}': {}", index, f.node_id, f.message);
                                return NodeResult::failure(failure);
                            }
                            errors.push(json!({"index": index, "node": f.node_id, "error": f.message}));
                            results.push(Value::Null);
                        }
                    }
                }
                index += 1;
            }

            let output = json!({
                "iterations": index,
                "results": results,
                "errors": errors,
                "truncated": truncated,
            });
            let next = if ctx.flow.edge_for_handle(&ctx.node.id, DONE_HANDLE).is_some() {
                Next::Handle(DONE_HANDLE.to_string())
            } else {
                match ctx.flow.outgoing(&ctx.node.id).find(|e| e.is_default()) {
                    Some(edge) => Next::Node(edge.target.clone()),
                    None => Next::Halt,
                }
            };
            NodeResult::route(output, next)
        })
    }
}
