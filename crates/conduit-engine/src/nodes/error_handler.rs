use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::warn;

use conduit_core::result::{ErrorKind, Next, NodeFailure, NodeResult};

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;
use crate::nodes::wrapped_target;
use crate::walker::route_after;

/// Handle taken under `onError: route`.
pub const ERROR_HANDLE: &str = "error";

/// Wraps the single node on its default edge and decides what a failure of
/// that node does to the run.
///
/// Applies to safety-limit failures too; cancellation always propagates.
pub struct ErrorHandlerExecutor;

impl NodeExecutor for ErrorHandlerExecutor {
    fn node_type(&self) -> &str {
        "logic:error_handler"
    }

    fn description(&self) -> &str {
        "Catches failures of the wrapped node"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        match config.get("onError").and_then(|v| v.as_str()) {
            Some(p) if !["fail", "continue", "route"].contains(&p) => {
                vec![format!("unknown onError '{}'", p)]
            }
            _ => Vec::new(),
        }
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let wrapped = match wrapped_target(&ctx.flow, &ctx.node.id) {
                Ok(id) => id,
                Err(f) => return NodeResult::failure(f),
            };

            let failure = match ctx.engine.execute_node(&ctx, &wrapped).await {
                NodeResult::Success { output, next } => {
                    return NodeResult::route(
                        json!({"handled": false, "output": output}),
                        route_after(&ctx.flow, &wrapped, next),
                    );
                }
                NodeResult::Skip { reason } => {
                    return NodeResult::route(
                        json!({"handled": false, "skipped": reason}),
                        Next::After(wrapped),
                    );
                }
                NodeResult::Failure(f) => f,
            };

            if failure.kind == ErrorKind::Aborted {
                return NodeResult::failure(failure);
            }
            if let Some(var) = ctx.param_str("errorVariable") {
                ctx.variables.set(var, failure.to_json());
            }

            let policy = ctx.param_str("onError").unwrap_or("fail");
            warn!(
                node_id = %ctx.node.id,
                wrapped = %wrapped,
                policy,
                error = %failure,
                "Wrapped node failed"
            );

            match policy {
                "continue" => {
                    let fallback = ctx.param("fallbackValue").cloned().unwrap_or(Value::Null);
                    ctx.set_output(&wrapped, fallback.clone());
                    NodeResult::route(
                        json!({"handled": true, "output": fallback, "error": failure.to_json()}),
                        Next::After(wrapped),
                    )
                }
                "route" => NodeResult::handle(
                    json!({"handled": true, "error": failure.to_json()}),
                    ERROR_HANDLE,
                ),
                _ => NodeResult::failure(NodeFailure { branch: None, ..failure }),
            }
        })
    }
}
