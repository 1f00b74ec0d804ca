use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use conduit_core::result::NodeResult;

use crate::context::ExecutionContext;
use crate::nodes;

/// Behavior behind a node type.
///
/// `execute` must produce exactly one `NodeResult` and must observe
/// `ctx.cancel` at any suspension point.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Registered type key, e.g. `logic:retry`.
    fn node_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Check a node configuration. Pure; returns human-readable problems.
    fn validate(&self, _config: &Value) -> Vec<String> {
        Vec::new()
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult>;
}

/// Registry of node executors keyed by type.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same type.
    pub fn register(&mut self, executor: impl NodeExecutor) {
        let key = executor.node_type().to_string();
        self.executors.insert(key, Arc::new(executor));
    }

    pub fn unregister(&mut self, node_type: &str) -> bool {
        self.executors.remove(node_type).is_some()
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Registered types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Create a registry with all built-in executors registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Triggers ────────────────────────────────────────────
        registry.register(nodes::trigger::TriggerExecutor::new("trigger:manual"));
        registry.register(nodes::trigger::TriggerExecutor::new("trigger:webhook"));
        registry.register(nodes::trigger::TriggerExecutor::new("trigger:message"));
        registry.register(nodes::trigger::TriggerExecutor::new("trigger:schedule"));

        // ── Control flow ────────────────────────────────────────
        registry.register(nodes::condition::ConditionExecutor);
        registry.register(nodes::switch::SwitchExecutor);
        registry.register(nodes::delay::DelayExecutor);
        registry.register(nodes::set_variable::SetVariableExecutor);
        registry.register(nodes::loop_node::LoopExecutor);
        registry.register(nodes::parallel::ParallelExecutor);
        registry.register(nodes::merge::MergeExecutor);
        registry.register(nodes::retry::RetryExecutor);
        registry.register(nodes::error_handler::ErrorHandlerExecutor);
        registry.register(nodes::subflow::SubflowExecutor);

        // ── Services ────────────────────────────────────────────
        registry.register(nodes::ai::CompletionExecutor);
        registry.register(nodes::ai::RouterExecutor);
        registry.register(nodes::message::SendMessageExecutor);
        registry.register(nodes::swarm::BroadcastExecutor);

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_registered() {
        let registry = ExecutorRegistry::with_builtins();
        for t in [
            "trigger:manual",
            "trigger:webhook",
            "logic:parallel",
            "logic:merge",
            "logic:retry",
            "logic:subflow",
            "logic:loop",
            "ai:router",
            "swarm:broadcast",
        ] {
            assert!(registry.contains(t), "missing {}", t);
        }
        assert!(registry.get("logic:teleport").is_none());
    }

    #[test]
    fn unregister_removes() {
        let mut registry = ExecutorRegistry::with_builtins();
        assert!(registry.unregister("logic:delay"));
        assert!(!registry.unregister("logic:delay"));
        assert!(!registry.list().contains(&"logic:delay"));
    }
}
