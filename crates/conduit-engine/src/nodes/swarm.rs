use futures::future::BoxFuture;
use serde_json::{json, Value};

use conduit_core::result::NodeResult;
use conduit_core::types::FlowEvent;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

/// Publishes an out-of-band event (handoff, consensus, ...) through the notifier.
pub struct BroadcastExecutor;

impl NodeExecutor for BroadcastExecutor {
    fn node_type(&self) -> &str {
        "swarm:broadcast"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        if config.get("topic").and_then(|v| v.as_str()).is_none() {
            return vec!["topic is required".to_string()];
        }
        Vec::new()
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let topic = ctx.param_str("topic").unwrap_or_default().to_string();
            let payload = ctx.param("payload").cloned().unwrap_or(Value::Null);
            ctx.notify(FlowEvent::Broadcast {
                execution_id: ctx.execution_id.clone(),
                topic: topic.clone(),
                payload: payload.clone(),
            });
            NodeResult::success(json!({"topic": topic, "payload": payload}))
        })
    }
}
