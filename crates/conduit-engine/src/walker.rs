use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conduit_core::config::AppConfig;
use conduit_core::error::Result;
use conduit_core::flow::{Flow, DEFAULT_HANDLE};
use conduit_core::result::{ErrorKind, Next, NodeFailure, NodeResult};
use conduit_core::types::{ExecutionId, FlowEvent, NodeState, RunStatus};

use crate::context::{ExecutionContext, Services, Variables};
use crate::executor::ExecutorRegistry;
use crate::report::{NodeRecord, PathOutcome, RunFailure, RunReport};

/// Per-run overrides, used by sub-flow invocation.
#[derive(Default)]
pub struct RunOptions {
    pub execution_id: Option<ExecutionId>,
    /// Variable map to run against; a fresh one seeded from the flow when absent.
    pub variables: Option<Variables>,
    /// Sub-flow nesting depth of this run (0 for top-level runs).
    pub depth: u32,
}

/// Executes flows.
///
/// Starting from the entry node, the walker dispatches each node to its
/// registered executor, records the outcome, and follows the routing carried
/// by the result (or the default edge) until a path ends, fails, or the run
/// is cancelled. Fan-out is only ever performed by fork nodes, which re-enter
/// the walker once per branch through [`GraphWalker::run_path`].
pub struct GraphWalker {
    registry: ExecutorRegistry,
    config: AppConfig,
}

impl GraphWalker {
    pub fn new(registry: ExecutorRegistry, config: AppConfig) -> Self {
        Self { registry, config }
    }

    /// Walker with every built-in node type registered.
    pub fn with_builtins(config: AppConfig) -> Self {
        Self::new(ExecutorRegistry::with_builtins(), config)
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Execute a flow from its entry node.
    pub async fn run(
        self: &Arc<Self>,
        flow: Arc<Flow>,
        input: Value,
        services: Arc<Services>,
        cancel: CancellationToken,
    ) -> RunReport {
        self.run_with(flow, input, services, cancel, RunOptions::default())
            .await
    }

    /// Load a flow from the flow store and execute it.
    pub async fn run_stored(
        self: &Arc<Self>,
        flow_id: &str,
        input: Value,
        services: Arc<Services>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let flow = services.flows.load(flow_id).await?;
        Ok(self.run(flow, input, services, cancel).await)
    }

    pub async fn run_with(
        self: &Arc<Self>,
        flow: Arc<Flow>,
        input: Value,
        services: Arc<Services>,
        cancel: CancellationToken,
        options: RunOptions,
    ) -> RunReport {
        let started = Instant::now();
        let execution_id = options.execution_id.unwrap_or_default();
        let variables = options.variables.unwrap_or_default();
        variables.seed(&flow.variables);

        // Run-scoped token: a timeout cancels this run without touching the caller's.
        let run_cancel = cancel.child_token();
        let ctx = ExecutionContext::root(
            execution_id.clone(),
            flow.clone(),
            input,
            variables.clone(),
            run_cancel.clone(),
            services,
            options.depth,
            self.clone(),
        );

        info!(
            execution_id = %execution_id,
            flow_id = %flow.id,
            depth = options.depth,
            "Run started"
        );
        ctx.notify(FlowEvent::RunStarted {
            execution_id: execution_id.clone(),
            flow_id: flow.id.clone(),
            depth: options.depth,
        });

        let (status, output, failure) = match flow.entry_node() {
            None => (
                RunStatus::Failed,
                Value::Null,
                Some(RunFailure {
                    node_id: String::new(),
                    kind: ErrorKind::Config,
                    message: "flow has no entry node".into(),
                    code: None,
                }),
            ),
            Some(entry) => {
                let entry = entry.id.clone();
                let walk = self.run_path(&ctx, &entry, None);
                let timeout_secs = self.config.engine.run_timeout_secs;
                let outcome = if timeout_secs == 0 {
                    Some(walk.await)
                } else {
                    tokio::time::timeout(Duration::from_secs(timeout_secs), walk)
                        .await
                        .ok()
                };

                match outcome {
                    Some(PathOutcome::Completed { output }) => (RunStatus::Completed, output, None),
                    Some(PathOutcome::Failed(f)) => (RunStatus::Failed, Value::Null, Some(f)),
                    Some(PathOutcome::Cancelled) => (RunStatus::Cancelled, Value::Null, None),
                    None => (
                        RunStatus::TimedOut,
                        Value::Null,
                        Some(RunFailure {
                            node_id: String::new(),
                            kind: ErrorKind::Timeout,
                            message: format!("run exceeded {}s", timeout_secs),
                            code: None,
                        }),
                    ),
                }
            }
        };

        // Stops branches a fork left running.
        run_cancel.cancel();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match (&status, &failure) {
            (RunStatus::Completed, _) => {
                info!(execution_id = %execution_id, flow_id = %flow.id, elapsed_ms, "Run completed")
            }
            (RunStatus::Cancelled, _) => {
                warn!(execution_id = %execution_id, flow_id = %flow.id, "Run cancelled")
            }
            (_, Some(f)) => error!(
                execution_id = %execution_id,
                flow_id = %flow.id,
                node_id = %f.node_id,
                kind = %f.kind,
                error = %f.message,
                "Run failed"
            ),
            _ => {}
        }

        ctx.notify(FlowEvent::RunFinished {
            execution_id: execution_id.clone(),
            flow_id: flow.id.clone(),
            status,
            error_kind: failure.as_ref().map(|f| f.kind),
        });

        let node_records = ctx.trace.lock().clone();
        RunReport {
            execution_id,
            flow_id: flow.id.clone(),
            status,
            output,
            node_records,
            variables: variables.snapshot(),
            error: failure,
            elapsed_ms,
        }
    }

    /// Walk one linear path starting at `start`.
    ///
    /// The path ends at a node with nowhere to go, or just before entering
    /// `stop_at` (fork branches stop at their merge, loop bodies at the loop).
    pub fn run_path<'a>(
        self: &'a Arc<Self>,
        ctx: &'a ExecutionContext,
        start: &'a str,
        stop_at: Option<&'a str>,
    ) -> BoxFuture<'a, PathOutcome> {
        Box::pin(async move {
            let max_visits = self.config.engine.max_node_visits;
            let mut visits = 0usize;
            let mut last_output = Value::Null;
            let mut current = Some(start.to_string());

            while let Some(node_id) = current.take() {
                if stop_at == Some(node_id.as_str()) {
                    break;
                }
                if ctx.cancel.is_cancelled() {
                    return PathOutcome::Cancelled;
                }
                visits += 1;
                if max_visits > 0 && visits > max_visits {
                    warn!(execution_id = %ctx.execution_id, node_id = %node_id, max_visits, "Node visit limit reached");
                    return PathOutcome::Failed(RunFailure {
                        node_id,
                        kind: ErrorKind::MaxIterationsExceeded,
                        message: format!("path exceeded {} node visits", max_visits),
                        code: None,
                    });
                }

                match self.execute_node(ctx, &node_id).await {
                    NodeResult::Success { output, next } => {
                        last_output = output;
                        match next_target(&ctx.flow, &node_id, next) {
                            Ok(target) => current = target,
                            Err(f) => return PathOutcome::Failed(RunFailure::new(node_id, &f)),
                        }
                    }
                    NodeResult::Skip { .. } => {
                        current = ctx.flow.default_edge(&node_id).map(|e| e.target.clone());
                    }
                    NodeResult::Failure(failure) => {
                        if failure.kind == ErrorKind::Aborted && ctx.cancel.is_cancelled() {
                            return PathOutcome::Cancelled;
                        }
                        if let Some(edge) = failure
                            .branch
                            .as_deref()
                            .and_then(|b| ctx.flow.edge_for_handle(&node_id, b))
                        {
                            debug!(
                                node_id = %node_id,
                                branch = %edge.handle(),
                                "Failure routed to branch"
                            );
                            current = Some(edge.target.clone());
                            continue;
                        }
                        return PathOutcome::Failed(RunFailure::new(node_id, &failure));
                    }
                }
            }

            PathOutcome::Completed {
                output: last_output,
            }
        })
    }

    /// Dispatch one node to its executor and record the outcome.
    ///
    /// Wrappers (retry, error handler) call this directly for the node they wrap.
    pub fn execute_node<'a>(
        self: &'a Arc<Self>,
        ctx: &'a ExecutionContext,
        node_id: &'a str,
    ) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let Some(node) = ctx.flow.node(node_id).cloned() else {
                return NodeResult::failure(NodeFailure::config(format!(
                    "node '{}' not found in flow '{}'",
                    node_id, ctx.flow.id
                )));
            };
            let Some(executor) = self.registry.get(&node.node_type) else {
                return NodeResult::failure(NodeFailure::config(format!(
                    "no executor registered for node type '{}'",
                    node.node_type
                )));
            };

            let config = ctx.resolve(&node.data);
            let node_ctx = ctx.for_node(node.clone(), config);

            debug!(
                execution_id = %ctx.execution_id,
                node_id = %node.id,
                node_type = %node.node_type,
                "Executing node"
            );
            ctx.notify(FlowEvent::NodeStarted {
                execution_id: ctx.execution_id.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                result = executor.execute(node_ctx) => result,
                _ = ctx.cancel.cancelled() => NodeResult::failure(NodeFailure::aborted()),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (state, output, error) = match &result {
                NodeResult::Success { output, .. } => {
                    ctx.set_output(&node.id, output.clone());
                    (NodeState::Succeeded, Some(output.clone()), None)
                }
                NodeResult::Failure(f) => (NodeState::Failed, None, Some(f.clone())),
                NodeResult::Skip { reason } => {
                    debug!(node_id = %node.id, reason = %reason, "Node skipped");
                    (NodeState::Skipped, None, None)
                }
            };

            debug!(
                execution_id = %ctx.execution_id,
                node_id = %node.id,
                state = ?state,
                elapsed_ms,
                "Node execution complete"
            );

            ctx.record(NodeRecord {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                state,
                output,
                error,
                elapsed_ms,
            });
            ctx.notify(FlowEvent::NodeFinished {
                execution_id: ctx.execution_id.clone(),
                node_id: node.id.clone(),
                state,
                elapsed_ms,
            });

            result
        })
    }
}

/// Where a path goes after a successful node.
fn next_target(
    flow: &Flow,
    node_id: &str,
    next: Option<Next>,
) -> std::result::Result<Option<String>, NodeFailure> {
    let target = match next {
        None => flow.default_edge(node_id).map(|e| e.target.clone()),
        Some(Next::Handle(handle)) => {
            let edge = if handle == DEFAULT_HANDLE {
                flow.default_edge(node_id)
            } else {
                flow.edge_for_handle(node_id, &handle)
            };
            if edge.is_none() {
                debug!(node_id, handle = %handle, "No edge for handle, path ends");
            }
            edge.map(|e| e.target.clone())
        }
        Some(Next::Node(id)) => {
            if flow.node(&id).is_none() {
                return Err(NodeFailure::config(format!(
                    "route target '{}' does not exist",
                    id
                )));
            }
            Some(id)
        }
        Some(Next::After(id)) => flow.default_edge(&id).map(|e| e.target.clone()),
        Some(Next::Halt) => None,
    };
    Ok(target)
}

/// Translate the routing of a wrapped node into routing for its wrapper.
///
/// Handles are relative to the node that produced them, so a wrapper re-anchors
/// them on the wrapped node.
pub fn route_after(flow: &Flow, wrapped: &str, next: Option<Next>) -> Next {
    match next {
        None => Next::After(wrapped.to_string()),
        Some(Next::Handle(handle)) => {
            let edge = if handle == DEFAULT_HANDLE {
                flow.default_edge(wrapped)
            } else {
                flow.edge_for_handle(wrapped, &handle)
            };
            match edge {
                Some(e) => Next::Node(e.target.clone()),
                None => Next::Halt,
            }
        }
        Some(other) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::flow::{Edge, Node};

    fn flow() -> Flow {
        Flow {
            id: "f".into(),
            nodes: vec![
                Node::new("check", "logic:condition"),
                Node::new("yes", "logic:delay"),
                Node::new("no", "logic:delay"),
            ],
            edges: vec![
                Edge::labeled("check", "yes", "true"),
                Edge::labeled("check", "no", "false"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn handle_routing() {
        let flow = flow();
        assert_eq!(
            next_target(&flow, "check", Some(Next::Handle("false".into()))).unwrap(),
            Some("no".to_string())
        );
        assert_eq!(
            next_target(&flow, "check", Some(Next::Handle("maybe".into()))).unwrap(),
            None
        );
        assert_eq!(next_target(&flow, "check", Some(Next::Halt)).unwrap(), None);
        // Labeled edges are never followed without their handle.
        assert_eq!(next_target(&flow, "check", None).unwrap(), None);
        assert!(next_target(&flow, "check", Some(Next::Node("ghost".into()))).is_err());
    }

    #[test]
    fn wrapper_routing_reanchors_handles() {
        let flow = flow();
        assert_eq!(
            route_after(&flow, "check", Some(Next::Handle("false".into()))),
            Next::Node("no".into())
        );
        assert_eq!(route_after(&flow, "check", None), Next::After("check".into()));
        assert_eq!(
            route_after(&flow, "check", Some(Next::Handle("other".into()))),
            Next::Halt
        );
    }
}
