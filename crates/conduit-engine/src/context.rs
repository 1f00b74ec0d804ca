use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use conduit_core::flow::{Flow, Node};
use conduit_core::template::{resolve_template, TemplateContext};
use conduit_core::traits::{AiService, CircuitBreaker, FlowStore, MessageSender, Notifier};
use conduit_core::types::{ExecutionId, FlowEvent};
use conduit_core::EventBus;

use crate::board::BranchBoard;
use crate::report::NodeRecord;
use crate::walker::GraphWalker;

/// Handles to the external collaborators, shared by every context of a run.
pub struct Services {
    pub ai: Option<Arc<dyn AiService>>,
    /// Senders keyed by channel name.
    pub messaging: HashMap<String, Arc<dyn MessageSender>>,
    pub flows: Arc<dyn FlowStore>,
    pub notifier: Arc<dyn Notifier>,
    pub circuit_breaker: Option<Arc<dyn CircuitBreaker>>,
}

impl Services {
    pub fn new(flows: Arc<dyn FlowStore>) -> Self {
        Self {
            ai: None,
            messaging: HashMap::new(),
            flows,
            notifier: Arc::new(EventBus::default()),
            circuit_breaker: None,
        }
    }

    pub fn with_ai(mut self, ai: Arc<dyn AiService>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.messaging.insert(sender.channel().to_string(), sender);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }
}

/// The flow variable map. Cloning shares the same underlying map.
///
/// Writes are last-writer-wins; no ordering is imposed between concurrent branches.
#[derive(Clone, Default)]
pub struct Variables(Arc<RwLock<HashMap<String, Value>>>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &serde_json::Map<String, Value>) -> Self {
        let vars = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Self(Arc::new(RwLock::new(vars)))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.write().insert(name.into(), value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.write().remove(name)
    }

    /// Insert declared defaults for names not yet present.
    pub fn seed(&self, defaults: &serde_json::Map<String, Value>) {
        let mut vars = self.0.write();
        for (k, v) in defaults {
            vars.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.0.read().clone()
    }

    /// A detached deep copy.
    pub fn fork(&self) -> Self {
        Self(Arc::new(RwLock::new(self.snapshot())))
    }

    /// Whether both handles point at the same map.
    pub fn shares_with(&self, other: &Variables) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, HashMap<String, Value>> {
        self.0.read()
    }
}

/// Variable visibility of a sub-flow relative to its caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableMode {
    /// Fresh empty map.
    #[default]
    Isolated,
    /// Copy on enter, writes do not propagate back.
    Inherit,
    /// Same map as the caller, writes propagate both ways.
    Shared,
}

impl VariableMode {
    pub fn derive(&self, parent: &Variables) -> Variables {
        match self {
            Self::Isolated => Variables::new(),
            Self::Inherit => parent.fork(),
            Self::Shared => parent.clone(),
        }
    }
}

pub(crate) type Outputs = Arc<RwLock<HashMap<String, Value>>>;
pub(crate) type Trace = Arc<Mutex<Vec<NodeRecord>>>;
pub(crate) type Boards = Arc<Mutex<HashMap<String, Arc<BranchBoard>>>>;

/// Per-node bundle handed to an executor.
///
/// Created once per run and narrowed per node invocation. Clones share the
/// run's variables, node outputs, branch boards and trace.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub flow: Arc<Flow>,
    /// The node being executed.
    pub node: Node,
    /// Node configuration with templates resolved.
    pub config: Value,
    /// Flow input (the trigger payload).
    pub input: Value,
    pub variables: Variables,
    pub cancel: CancellationToken,
    pub services: Arc<Services>,
    pub subflow_depth: u32,
    pub engine: Arc<GraphWalker>,
    pub(crate) outputs: Outputs,
    pub(crate) boards: Boards,
    pub(crate) trace: Trace,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn root(
        execution_id: ExecutionId,
        flow: Arc<Flow>,
        input: Value,
        variables: Variables,
        cancel: CancellationToken,
        services: Arc<Services>,
        subflow_depth: u32,
        engine: Arc<GraphWalker>,
    ) -> Self {
        Self {
            execution_id,
            flow,
            node: Node::new("", ""),
            config: Value::Null,
            input,
            variables,
            cancel,
            services,
            subflow_depth,
            engine,
            outputs: Default::default(),
            boards: Default::default(),
            trace: Default::default(),
        }
    }

    pub(crate) fn for_node(&self, node: Node, config: Value) -> Self {
        let mut ctx = self.clone();
        ctx.node = node;
        ctx.config = config;
        ctx
    }

    /// Same run, different cancellation scope (fork branches).
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancel = cancel;
        ctx
    }

    /// Resolve `{{...}}` placeholders against the current run state.
    pub fn resolve(&self, value: &Value) -> Value {
        let outputs = self.outputs.read();
        let variables = self.variables.read();
        let scope = TemplateContext {
            input: &self.input,
            nodes: &outputs,
            variables: &variables,
        };
        resolve_template(value, &scope)
    }

    /// Raw (unresolved) configuration of the current node.
    pub fn raw_config(&self) -> &Value {
        &self.node.data
    }

    /// Read a resolved config field.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.config.get(key).filter(|v| !v.is_null())
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.param(key).and_then(value_as_u64)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.param(key).and_then(|v| v.as_bool())
    }

    /// Output recorded for a node earlier in this run.
    pub fn node_output(&self, node_id: &str) -> Option<Value> {
        self.outputs.read().get(node_id).cloned()
    }

    pub(crate) fn set_output(&self, node_id: &str, output: Value) {
        self.outputs.write().insert(node_id.to_string(), output);
    }

    /// Results published by fork branches for the current node, keyed by branch name.
    /// Only populated when the current node is the join target of a fork.
    pub fn branch_results(&self) -> Option<HashMap<String, Value>> {
        self.board(&self.node.id)
            .map(|b| b.snapshot().arrived.into_iter().collect())
    }

    pub(crate) fn board(&self, merge_id: &str) -> Option<Arc<BranchBoard>> {
        self.boards.lock().get(merge_id).cloned()
    }

    pub(crate) fn open_board(&self, merge_id: &str, board: Arc<BranchBoard>) {
        self.boards.lock().insert(merge_id.to_string(), board);
    }

    pub(crate) fn record(&self, record: NodeRecord) {
        self.trace.lock().push(record);
    }

    pub fn notify(&self, event: FlowEvent) {
        self.services.notifier.notify(event);
    }
}

/// Accept integers, non-negative floats and numeric strings.
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn variable_modes() {
        let parent = Variables::new();
        parent.set("x", json!(1));

        let isolated = VariableMode::Isolated.derive(&parent);
        assert!(isolated.get("x").is_none());

        let inherited = VariableMode::Inherit.derive(&parent);
        inherited.set("x", json!(2));
        assert_eq!(parent.get("x"), Some(json!(1)));
        assert!(!inherited.shares_with(&parent));

        let shared = VariableMode::Shared.derive(&parent);
        shared.set("x", json!(3));
        assert_eq!(parent.get("x"), Some(json!(3)));
        assert!(shared.shares_with(&parent));
    }

    #[test]
    fn seed_keeps_existing_values() {
        let vars = Variables::new();
        vars.set("a", json!("kept"));
        let defaults = json!({"a": "default", "b": 0});
        vars.seed(defaults.as_object().unwrap());
        assert_eq!(vars.get("a"), Some(json!("kept")));
        assert_eq!(vars.get("b"), Some(json!(0)));
    }

    #[test]
    fn numeric_params() {
        assert_eq!(value_as_u64(&json!(5)), Some(5));
        assert_eq!(value_as_u64(&json!("250")), Some(250));
        assert_eq!(value_as_u64(&json!(-1)), None);
        assert_eq!(value_as_u64(&json!(true)), None);
    }
}
