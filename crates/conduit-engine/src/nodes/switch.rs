use futures::future::BoxFuture;
use serde_json::{json, Value};

use conduit_core::result::{Next, NodeResult};
use conduit_core::template::stringify;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

/// Multi-way branch on a value.
///
/// Case `i` routes to its `handle`, or to the case value rendered as text.
/// When nothing matches, a configured `defaultCase` routes to `default`;
/// otherwise the path ends.
pub struct SwitchExecutor;

fn case_matches(case_value: &Value, value: &Value) -> bool {
    case_value == value || stringify(case_value) == stringify(value)
}

impl NodeExecutor for SwitchExecutor {
    fn node_type(&self) -> &str {
        "logic:switch"
    }

    fn description(&self) -> &str {
        "Routes to the handle of the first matching case"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        match config.get("cases").and_then(|v| v.as_array()) {
            None => errors.push("cases is required".to_string()),
            Some(cases) => {
                for (i, case) in cases.iter().enumerate() {
                    if case.get("value").is_none() {
                        errors.push(format!("cases[{}]: value is required", i));
                    }
                }
            }
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let value = ctx.config.get("value").cloned().unwrap_or(Value::Null);
            let cases = ctx
                .config
                .get("cases")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            for (index, case) in cases.iter().enumerate() {
                let case_value = case.get("value").unwrap_or(&Value::Null);
                if case_matches(case_value, &value) {
                    let handle = case
                        .get("handle")
                        .and_then(|h| h.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| stringify(case_value));
                    return NodeResult::handle(
                        json!({"matchedCase": stringify(case_value), "index": index, "value": value}),
                        handle,
                    );
                }
            }

            if ctx.param("defaultCase").is_some() {
                return NodeResult::handle(
                    json!({"matchedCase": "default", "index": null, "value": value}),
                    "default",
                );
            }

            NodeResult::route(
                json!({"matchedCase": null, "index": null, "value": value}),
                Next::Halt,
            )
        })
    }
}
