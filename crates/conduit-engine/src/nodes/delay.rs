use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use conduit_core::result::{NodeFailure, NodeResult};

use crate::context::{value_as_u64, ExecutionContext};
use crate::executor::NodeExecutor;
use crate::sleep::sleep_cancellable;

pub struct DelayExecutor;

impl NodeExecutor for DelayExecutor {
    fn node_type(&self) -> &str {
        "logic:delay"
    }

    fn description(&self) -> &str {
        "Waits for durationMs before continuing"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        match config.get("durationMs") {
            None => vec!["durationMs is required".to_string()],
            Some(Value::String(s)) if s.contains("{{") => Vec::new(),
            Some(v) if value_as_u64(v).is_none() => {
                vec!["durationMs must be a non-negative number".to_string()]
            }
            Some(_) => Vec::new(),
        }
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let ms = ctx.param_u64("durationMs").unwrap_or(0);
            if !sleep_cancellable(Duration::from_millis(ms), &ctx.cancel).await {
                return NodeResult::failure(NodeFailure::aborted());
            }
            NodeResult::success(json!({"delayedMs": ms}))
        })
    }
}
