use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use conduit_core::result::{ErrorKind, NodeFailure, NodeResult};
use conduit_core::types::{ExecutionId, RunStatus};

use crate::context::{ExecutionContext, VariableMode};
use crate::executor::NodeExecutor;
use crate::report::RunReport;
use crate::walker::RunOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnError {
    Fail,
    Continue,
    Skip,
}

fn parse_mode(s: &str) -> Option<VariableMode> {
    match s {
        "isolated" => Some(VariableMode::Isolated),
        "inherit" => Some(VariableMode::Inherit),
        "shared" => Some(VariableMode::Shared),
        _ => None,
    }
}

/// Value a child run exposes under `name`: its final variables first, then
/// fields of its final output.
fn child_value(report: &RunReport, name: &str) -> Option<Value> {
    report
        .variables
        .get(name)
        .cloned()
        .or_else(|| report.output.get(name).cloned())
}

/// Re-enters the walker against another flow definition.
pub struct SubflowExecutor;

impl NodeExecutor for SubflowExecutor {
    fn node_type(&self) -> &str {
        "logic:subflow"
    }

    fn description(&self) -> &str {
        "Runs another flow as a nested invocation"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if config.get("flowId").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
            errors.push("flowId is required".to_string());
        }
        if let Some(m) = config.get("variableMode").and_then(|v| v.as_str()) {
            if parse_mode(m).is_none() {
                errors.push(format!("unknown variableMode '{}'", m));
            }
        }
        if let Some(p) = config.get("onError").and_then(|v| v.as_str()) {
            if !["fail", "continue", "skip"].contains(&p) {
                errors.push(format!("unknown onError '{}'", p));
            }
        }
        for key in ["inputMapping", "outputMapping"] {
            if let Some(m) = config.get(key) {
                if !m.is_object() {
                    errors.push(format!("{} must be an object", key));
                }
            }
        }
        if config.get("maxDepth").is_some_and(|v| v.as_u64().is_none()) {
            errors.push("maxDepth must be a non-negative integer".to_string());
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let Some(flow_id) = ctx.param_str("flowId").map(str::to_string) else {
                return NodeResult::failure(NodeFailure::config("flowId is required"));
            };
            let mode = ctx
                .param_str("variableMode")
                .and_then(parse_mode)
                .unwrap_or_default();
            let on_error = match ctx.param_str("onError") {
                Some("continue") => OnError::Continue,
                Some("skip") => OnError::Skip,
                _ => OnError::Fail,
            };
            let max_depth = ctx
                .param_u64("maxDepth")
                .map(|d| d as u32)
                .unwrap_or(ctx.engine.config().engine.max_subflow_depth);
            let child_depth = ctx.subflow_depth + 1;

            // Checked before the child flow is loaded or touched.
            if child_depth > max_depth {
                let failure = NodeFailure::new(
                    ErrorKind::MaxDepthExceeded,
                    format!(
                        "subflow '{}' at depth {} exceeds maxDepth {}",
                        flow_id, child_depth, max_depth
                    ),
                );
                return recover(&ctx, on_error, failure);
            }

            let flow = match ctx.services.flows.load(&flow_id).await {
                Ok(flow) => flow,
                Err(e) => {
                    return recover(
                        &ctx,
                        on_error,
                        NodeFailure::config(e.to_string()).with_code("FLOW_NOT_FOUND"),
                    )
                }
            };

            // Child input: optional base object, then mapped parent variables.
            let mut input = match ctx.param("input") {
                Some(Value::Object(base)) => base.clone(),
                _ => Map::new(),
            };
            if let Some(mapping) = ctx.param("inputMapping").and_then(|v| v.as_object()) {
                for (parent_var, child_name) in mapping {
                    if let Some(name) = child_name.as_str() {
                        let value = ctx.variables.get(parent_var).unwrap_or(Value::Null);
                        input.insert(name.to_string(), value);
                    }
                }
            }

            let variables = mode.derive(&ctx.variables);
            let child_cancel = ctx.cancel.child_token();
            let child_id = ExecutionId::new();
            info!(
                execution_id = %ctx.execution_id,
                child_execution_id = %child_id,
                flow_id = %flow_id,
                depth = child_depth,
                mode = ?mode,
                "Invoking subflow"
            );

            let run = ctx.engine.run_with(
                flow,
                Value::Object(input),
                ctx.services.clone(),
                child_cancel.clone(),
                RunOptions {
                    execution_id: Some(child_id),
                    variables: Some(variables),
                    depth: child_depth,
                },
            );

            let report = match ctx.param_u64("timeoutMs").filter(|ms| *ms > 0) {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                    Ok(report) => report,
                    Err(_) => {
                        child_cancel.cancel();
                        let failure = NodeFailure::new(
                            ErrorKind::SubflowTimeout,
                            format!("subflow '{}' exceeded {}ms", flow_id, ms),
                        );
                        return recover(&ctx, on_error, failure);
                    }
                },
                None => run.await,
            };

            // Copied back in every visibility mode.
            if let Some(mapping) = ctx.param("outputMapping").and_then(|v| v.as_object()) {
                for (child_name, parent_var) in mapping {
                    if let (Some(var), Some(value)) =
                        (parent_var.as_str(), child_value(&report, child_name))
                    {
                        ctx.variables.set(var, value);
                    }
                }
            }

            match report.status {
                RunStatus::Completed => NodeResult::success(json!({
                    "flowId": flow_id,
                    "executionId": report.execution_id,
                    "status": report.status,
                    "output": report.output,
                })),
                RunStatus::Cancelled if ctx.cancel.is_cancelled() => {
                    NodeResult::failure(NodeFailure::aborted())
                }
                _ => {
                    let failure = match &report.error {
                        Some(e) => {
                            let mut f = NodeFailure::new(
                                e.kind,
                                format!("subflow '{}' failed at '{}': {}", flow_id, e.node_id, e.message),
                            );
                            f.code = e.code.clone();
                            f
                        }
                        None => NodeFailure::new(
                            ErrorKind::Execution,
                            format!("subflow '{}' ended {:?}", flow_id, report.status),
                        ),
                    };
                    recover(&ctx, on_error, failure)
                }
            }
        })
    }
}

fn recover(ctx: &ExecutionContext, on_error: OnError, failure: NodeFailure) -> NodeResult {
    match on_error {
        OnError::Fail => NodeResult::failure(failure),
        OnError::Continue => {
            warn!(node_id = %ctx.node.id, error = %failure, "Subflow failed, continuing");
            NodeResult::success(json!({"output": null, "error": failure.to_json()}))
        }
        OnError::Skip => {
            warn!(node_id = %ctx.node.id, error = %failure, "Subflow failed, skipping");
            NodeResult::skip(failure.to_string())
        }
    }
}
