//! Mocks and fixtures shared by the Conduit test suites.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};

use conduit_core::config::AppConfig;
use conduit_core::error::{ConduitError, Result};
use conduit_core::flow::{Edge, Flow, Node};
use conduit_core::result::{ErrorKind, NodeFailure, NodeResult};
use conduit_core::store::InMemoryFlowStore;
use conduit_core::traits::{AiService, MessageSender};
use conduit_core::types::*;
use conduit_engine::{ExecutionContext, ExecutorRegistry, GraphWalker, NodeExecutor, Services};

// ── Executors ───────────────────────────────────────────────

/// Succeeds with its `output` config field, or the whole resolved config.
pub struct EchoExecutor {
    node_type: &'static str,
}

impl EchoExecutor {
    pub fn new(node_type: &'static str) -> Self {
        Self { node_type }
    }
}

impl NodeExecutor for EchoExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let output = ctx
                .config
                .get("output")
                .cloned()
                .unwrap_or_else(|| ctx.config.clone());
            NodeResult::success(output)
        })
    }
}

/// Always fails with the configured kind, counting calls.
pub struct FailingExecutor {
    node_type: &'static str,
    kind: ErrorKind,
    code: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl FailingExecutor {
    pub fn new(node_type: &'static str, kind: ErrorKind) -> Self {
        Self {
            node_type,
            kind,
            code: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl NodeExecutor for FailingExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut failure = NodeFailure::new(self.kind, format!("{} failed (call {})", ctx.node.id, n));
            failure.code = self.code.clone();
            NodeResult::failure(failure)
        })
    }
}

/// Fails with a transient error `failures` times, then succeeds.
pub struct FlakyExecutor {
    node_type: &'static str,
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyExecutor {
    pub fn new(node_type: &'static str, failures: u32) -> Self {
        Self {
            node_type,
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl NodeExecutor for FlakyExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    fn execute(&self, _ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                NodeResult::failure(NodeFailure::classify(format!("connection reset (call {})", n)))
            } else {
                NodeResult::success(json!({"call": n}))
            }
        })
    }
}

/// Sleeps for config `ms`, then succeeds with config `value`, or fails when
/// config `fail` is true (routed to config `branch` when set). Observes cancellation.
pub struct SleepExecutor {
    node_type: &'static str,
}

impl SleepExecutor {
    pub fn new(node_type: &'static str) -> Self {
        Self { node_type }
    }
}

impl NodeExecutor for SleepExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let ms = ctx.param_u64("ms").unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = ctx.cancel.cancelled() => return NodeResult::failure(NodeFailure::aborted()),
            }
            if ctx.param_bool("fail").unwrap_or(false) {
                let mut failure = NodeFailure::new(
                    ErrorKind::Execution,
                    format!("{} failed after {}ms", ctx.node.id, ms),
                );
                if let Some(branch) = ctx.param_str("branch") {
                    failure = failure.with_branch(branch);
                }
                return NodeResult::failure(failure);
            }
            NodeResult::success(ctx.param("value").cloned().unwrap_or(json!(ms)))
        })
    }
}

/// Succeeds with its running call count.
pub struct CountingExecutor {
    node_type: &'static str,
    calls: Arc<AtomicUsize>,
}

impl CountingExecutor {
    pub fn new(node_type: &'static str) -> Self {
        Self {
            node_type,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl NodeExecutor for CountingExecutor {
    fn node_type(&self) -> &str {
        self.node_type
    }

    fn execute(&self, _ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            NodeResult::success(json!({"count": n}))
        })
    }
}

// ── Services ────────────────────────────────────────────────

/// AI service replaying scripted replies; `Err` entries become service errors.
#[derive(Default)]
pub struct ScriptedAi {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    requests: Mutex<Vec<AiRequest>>,
}

impl ScriptedAi {
    pub fn new(replies: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn requests(&self) -> Vec<AiRequest> {
        self.requests.lock().clone()
    }
}

impl AiService for ScriptedAi {
    fn complete(&self, request: AiRequest) -> BoxFuture<'_, Result<AiResponse>> {
        self.requests.lock().push(request);
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err("no scripted reply".to_string()));
        Box::pin(async move {
            match reply {
                Ok(content) => Ok(AiResponse {
                    content,
                    provider: "scripted".into(),
                    model: "scripted-1".into(),
                    usage: Usage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                }),
                Err(e) => Err(ConduitError::Ai(e)),
            }
        })
    }
}

/// Messaging sender that records what it was asked to send.
pub struct RecordingMessenger {
    channel: String,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingMessenger {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

impl MessageSender for RecordingMessenger {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<DeliveryReceipt>> {
        let mut sent = self.sent.lock();
        sent.push(message);
        let id = format!("msg-{}", sent.len());
        Box::pin(async move {
            Ok(DeliveryReceipt {
                message_id: id,
                delivered_at: None,
            })
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────

/// Fluent flow construction for tests.
pub struct FlowBuilder {
    flow: Flow,
}

impl FlowBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            flow: Flow {
                id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn node(mut self, id: &str, node_type: &str, data: Value) -> Self {
        self.flow.nodes.push(Node::new(id, node_type).with_data(data));
        self
    }

    /// Manual trigger node named `start`.
    pub fn trigger(self) -> Self {
        self.node("start", "trigger:manual", json!({}))
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        self.flow.edges.push(Edge::new(source, target));
        self
    }

    pub fn labeled(mut self, source: &str, target: &str, label: &str) -> Self {
        self.flow.edges.push(Edge::labeled(source, target, label));
        self
    }

    pub fn variable(mut self, name: &str, value: Value) -> Self {
        self.flow.variables.insert(name.to_string(), value);
        self
    }

    pub fn build(self) -> Flow {
        self.flow
    }

    pub fn build_arc(self) -> Arc<Flow> {
        Arc::new(self.flow)
    }
}

/// Registry with the built-ins plus the `test:*` mocks
/// (`test:echo`, `test:sleep`, `test:count`).
pub fn test_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::with_builtins();
    registry.register(EchoExecutor::new("test:echo"));
    registry.register(SleepExecutor::new("test:sleep"));
    registry.register(CountingExecutor::new("test:count"));
    registry
}

pub fn walker(registry: ExecutorRegistry) -> Arc<GraphWalker> {
    walker_with_config(registry, AppConfig::default())
}

pub fn walker_with_config(registry: ExecutorRegistry, config: AppConfig) -> Arc<GraphWalker> {
    Arc::new(GraphWalker::new(registry, config))
}

/// Services over an in-memory flow store and a fresh event bus.
pub fn services(store: InMemoryFlowStore) -> Arc<Services> {
    Arc::new(Services::new(Arc::new(store)))
}
