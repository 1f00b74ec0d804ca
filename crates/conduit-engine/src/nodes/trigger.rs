use futures::future::BoxFuture;

use conduit_core::result::NodeResult;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

/// Entry point of a flow. Emits the trigger payload as its output.
pub struct TriggerExecutor {
    node_type: &'static str,
}

impl TriggerExecutor {
    pub fn new(node_type: &'static str) -> Self {
        Self { node_type }
    }
}

impl NodeExecutor for TriggerExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    fn description(&self) -> &str {
        "Passes the trigger payload through as output"
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move { NodeResult::success(ctx.input.clone()) })
    }
}
