use futures::future::BoxFuture;
use serde_json::{json, Value};

use conduit_core::result::{NodeFailure, NodeResult};
use conduit_core::types::OutboundMessage;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

/// Sends a message through the sender registered for `channel`.
pub struct SendMessageExecutor;

impl NodeExecutor for SendMessageExecutor {
    fn node_type(&self) -> &str {
        "message:send"
    }

    fn description(&self) -> &str {
        "Sends a message on a messaging channel"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        ["channel", "recipient", "text"]
            .iter()
            .filter(|k| config.get(**k).and_then(|v| v.as_str()).is_none())
            .map(|k| format!("{} is required", k))
            .collect()
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let channel = ctx.param_str("channel").unwrap_or_default().to_string();
            let Some(sender) = ctx.services.messaging.get(&channel).cloned() else {
                return NodeResult::failure(
                    NodeFailure::config(format!("channel '{}' is not configured", channel))
                        .with_code("CHANNEL_UNAVAILABLE"),
                );
            };
            let message = OutboundMessage {
                recipient: ctx.param_str("recipient").unwrap_or_default().to_string(),
                text: ctx.param_str("text").unwrap_or_default().to_string(),
            };

            match sender.send(message).await {
                Ok(receipt) => NodeResult::success(json!({
                    "channel": channel,
                    "messageId": receipt.message_id,
                    "deliveredAt": receipt.delivered_at,
                })),
                Err(e) => NodeResult::failure(NodeFailure::classify(e.to_string())),
            }
        })
    }
}
