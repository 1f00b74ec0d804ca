use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use conduit_core::result::{NodeFailure, NodeResult};
use conduit_core::traits::AiService;
use conduit_core::types::{AiMessage, AiRequest, AiResponse};

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

/// Handle taken when the router cannot place a message.
pub const CLARIFY_HANDLE: &str = "clarify";

fn ai_service(ctx: &ExecutionContext) -> Result<Arc<dyn AiService>, NodeFailure> {
    ctx.services
        .ai
        .clone()
        .ok_or_else(|| NodeFailure::config("AI service not configured").with_code("AI_UNAVAILABLE"))
}

async fn complete(ctx: &ExecutionContext, request: AiRequest) -> Result<AiResponse, NodeFailure> {
    let ai = ai_service(ctx)?;
    ai.complete(request)
        .await
        .map_err(|e| NodeFailure::classify(e.to_string()))
}

fn response_json(response: &AiResponse) -> Value {
    json!({
        "content": response.content,
        "provider": response.provider,
        "model": response.model,
        "usage": response.usage,
    })
}

/// Single AI completion.
pub struct CompletionExecutor;

impl NodeExecutor for CompletionExecutor {
    fn node_type(&self) -> &str {
        "ai:completion"
    }

    fn description(&self) -> &str {
        "Runs an AI completion over a prompt or message list"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let has_prompt = config.get("prompt").and_then(|v| v.as_str()).is_some();
        let has_messages = config.get("messages").and_then(|v| v.as_array()).is_some();
        if !has_prompt && !has_messages {
            return vec!["prompt or messages is required".to_string()];
        }
        Vec::new()
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let mut messages = Vec::new();
            if let Some(system) = ctx.param_str("system") {
                messages.push(AiMessage::system(system));
            }
            match ctx.param("messages") {
                Some(list) => match serde_json::from_value::<Vec<AiMessage>>(list.clone()) {
                    Ok(list) => messages.extend(list),
                    Err(e) => {
                        return NodeResult::failure(NodeFailure::config(format!(
                            "invalid messages: {}",
                            e
                        )))
                    }
                },
                None => messages.push(AiMessage::user(ctx.param_str("prompt").unwrap_or_default())),
            }

            let request = AiRequest {
                messages,
                tier: ctx.param_str("tier").map(str::to_string),
            };
            match complete(&ctx, request).await {
                Ok(response) => NodeResult::success(response_json(&response)),
                Err(f) => NodeResult::failure(f),
            }
        })
    }
}

/// Intent routing: asks the AI to pick one of the configured intents and
/// follows the edge labeled with it, or `clarify` when none fits.
pub struct RouterExecutor;

fn router_prompt(message: &str, routes: &[(String, String)]) -> String {
    let mut prompt = String::from(
        "Classify the message into exactly one intent. Reply with the intent name only, \
         or 'clarify' if none applies.\n\nIntents:\n",
    );
    for (intent, description) in routes {
        prompt.push_str(&format!("- {}: {}\n", intent, description));
    }
    prompt.push_str(&format!("\nMessage: {}", message));
    prompt
}

/// Match a reply against the intents, tolerating case, quotes and punctuation.
pub fn match_intent<'a>(reply: &str, intents: &'a [String]) -> Option<&'a str> {
    let cleaned: String = reply
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .to_lowercase();
    intents
        .iter()
        .find(|i| i.to_lowercase() == cleaned)
        .or_else(|| intents.iter().find(|i| cleaned.contains(&i.to_lowercase())))
        .map(|s| s.as_str())
}

impl NodeExecutor for RouterExecutor {
    fn node_type(&self) -> &str {
        "ai:router"
    }

    fn description(&self) -> &str {
        "Routes to the handle of the classified intent"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if config.get("message").is_none() {
            errors.push("message is required".to_string());
        }
        match config.get("routes").and_then(|v| v.as_array()) {
            Some(routes) if !routes.is_empty() => {
                for (i, r) in routes.iter().enumerate() {
                    if r.get("intent").and_then(|v| v.as_str()).is_none() {
                        errors.push(format!("routes[{}]: intent is required", i));
                    }
                }
            }
            _ => errors.push("routes must be a non-empty list".to_string()),
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let message = ctx.param_str("message").unwrap_or_default().to_string();
            let routes: Vec<(String, String)> = ctx
                .param("routes")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|r| {
                            let intent = r.get("intent")?.as_str()?.to_string();
                            let description = r
                                .get("description")
                                .and_then(|d| d.as_str())
                                .unwrap_or_default()
                                .to_string();
                            Some((intent, description))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let request = AiRequest {
                messages: vec![AiMessage::user(router_prompt(&message, &routes))],
                tier: Some(ctx.param_str("tier").unwrap_or("fast").to_string()),
            };
            let response = match complete(&ctx, request).await {
                Ok(r) => r,
                Err(f) => return NodeResult::failure(f),
            };

            let intents: Vec<String> = routes.into_iter().map(|(i, _)| i).collect();
            let intent = match_intent(&response.content, &intents).map(str::to_string);
            let handle = intent.clone().unwrap_or_else(|| CLARIFY_HANDLE.to_string());

            let mut output = response_json(&response);
            output["intent"] = json!(intent);
            output["route"] = json!(handle);
            NodeResult::handle(output, handle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_matching() {
        let intents = vec!["billing".to_string(), "support".to_string()];
        assert_eq!(match_intent("Billing", &intents), Some("billing"));
        assert_eq!(match_intent("\"support\".", &intents), Some("support"));
        assert_eq!(match_intent("I think this is billing", &intents), Some("billing"));
        assert_eq!(match_intent("clarify", &intents), None);
    }

    #[test]
    fn validation() {
        assert_eq!(CompletionExecutor.validate(&json!({})).len(), 1);
        assert!(CompletionExecutor.validate(&json!({"prompt": "hi"})).is_empty());
        assert_eq!(RouterExecutor.validate(&json!({"routes": []})).len(), 2);
    }
}
