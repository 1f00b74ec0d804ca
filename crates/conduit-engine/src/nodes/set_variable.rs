use futures::future::BoxFuture;
use serde_json::{json, Value};

use conduit_core::result::NodeResult;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

/// Writes resolved values into the flow variables.
pub struct SetVariableExecutor;

impl NodeExecutor for SetVariableExecutor {
    fn node_type(&self) -> &str {
        "logic:set_variable"
    }

    fn description(&self) -> &str {
        "Assigns flow variables"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        if config.get("variables").and_then(|v| v.as_object()).is_none() {
            return vec!["variables must be an object of name -> value".to_string()];
        }
        Vec::new()
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let assigned = ctx
                .config
                .get("variables")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            for (name, value) in &assigned {
                ctx.variables.set(name.clone(), value.clone());
            }
            NodeResult::success(json!({"set": assigned}))
        })
    }
}
