use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::warn;

use conduit_core::result::{ErrorKind, NodeFailure, NodeResult};

use crate::board::BoardSnapshot;
use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    All,
    Any,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleMissing {
    Error,
    Ignore,
    Default,
}

/// How arrived branch values are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Array,
    Object,
    First,
    Last,
    Concat,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            "concat" => Some(Self::Concat),
            _ => None,
        }
    }
}

/// Combine branch values.
///
/// `entries` are in branch declaration order; `arrival` lists the same names in
/// the order they arrived, which `first` and `last` follow.
pub fn aggregate(strategy: Strategy, entries: &[(String, Value)], arrival: &[String]) -> Value {
    let by_arrival = |pick_last: bool| {
        let mut names = arrival.iter();
        let name = if pick_last { names.next_back() } else { names.next() };
        name.and_then(|n| entries.iter().find(|(en, _)| en == n))
            .or(if pick_last { entries.last() } else { entries.first() })
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    };

    match strategy {
        Strategy::Array => Value::Array(entries.iter().map(|(_, v)| v.clone()).collect()),
        Strategy::Object => Value::Object(entries.iter().cloned().collect::<Map<_, _>>()),
        Strategy::First => by_arrival(false),
        Strategy::Last => by_arrival(true),
        Strategy::Concat => {
            let values: Vec<&Value> = entries.iter().map(|(_, v)| v).collect();
            if values.iter().all(|v| v.is_string()) {
                Value::String(values.iter().filter_map(|v| v.as_str()).collect())
            } else if values.iter().all(|v| v.is_array()) {
                Value::Array(
                    values
                        .iter()
                        .filter_map(|v| v.as_array())
                        .flatten()
                        .cloned()
                        .collect(),
                )
            } else {
                Value::Array(values.into_iter().cloned().collect())
            }
        }
    }
}

/// Join node: waits for branch arrivals published by its paired fork.
pub struct MergeExecutor;

impl NodeExecutor for MergeExecutor {
    fn node_type(&self) -> &str {
        "logic:merge"
    }

    fn description(&self) -> &str {
        "Waits for fork branches and aggregates their outputs"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        let get = |k: &str| config.get(k).and_then(|v| v.as_str());
        if let Some(m) = get("waitMode") {
            if !["all", "any", "count"].contains(&m) {
                errors.push(format!("unknown waitMode '{}'", m));
            }
        }
        if let Some(h) = get("handleMissing") {
            if !["error", "ignore", "default"].contains(&h) {
                errors.push(format!("unknown handleMissing '{}'", h));
            }
        }
        if let Some(s) = get("strategy") {
            if Strategy::parse(s).is_none() {
                errors.push(format!("unknown strategy '{}'", s));
            }
        }
        let expected = config.get("expectedBranches").and_then(|v| v.as_u64());
        if get("waitMode") == Some("count") {
            match (config.get("waitCount").and_then(|v| v.as_u64()), expected) {
                (None, _) => errors.push("waitCount is required when waitMode is 'count'".into()),
                (Some(n), Some(k)) if n > k => errors.push(format!(
                    "waitCount {} exceeds expectedBranches {}",
                    n, k
                )),
                _ => {}
            }
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let strategy = ctx
                .param_str("strategy")
                .and_then(Strategy::parse)
                .unwrap_or(Strategy::Array);
            let handle_missing = match ctx.param_str("handleMissing") {
                Some("ignore") => HandleMissing::Ignore,
                Some("default") => HandleMissing::Default,
                _ => HandleMissing::Error,
            };
            let wait_mode = match ctx.param_str("waitMode") {
                Some("any") => WaitMode::Any,
                Some("count") => WaitMode::Count,
                _ => WaitMode::All,
            };

            let Some(board) = ctx.board(&ctx.node.id) else {
                return merge_sequential(&ctx, strategy);
            };

            let names = board.names().to_vec();
            let expected = ctx
                .param_u64("expectedBranches")
                .map(|n| n as usize)
                .unwrap_or(names.len());
            let required = match wait_mode {
                WaitMode::All => expected,
                WaitMode::Any => expected.min(1),
                WaitMode::Count => ctx
                    .param_u64("waitCount")
                    .map(|n| n as usize)
                    .unwrap_or(expected)
                    .min(expected),
            };
            let deadline = ctx
                .param_u64("timeoutMs")
                .filter(|ms| *ms > 0)
                .map(|ms| Instant::now() + Duration::from_millis(ms));

            // Wait until the threshold is met, cannot be met any more, or time runs out.
            // Only branches on the board can still arrive, whatever `expectedBranches` says.
            let mut changes = board.subscribe();
            let mut timed_out = false;
            let snapshot = loop {
                let snap = board.snapshot();
                let pending = names.len().saturating_sub(snap.settled());
                if snap.arrived.len() >= required || snap.arrived.len() + pending < required {
                    break snap;
                }
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break board.snapshot();
                        }
                    }
                    _ = sleep_until(deadline) => {
                        timed_out = true;
                        break board.snapshot();
                    }
                    _ = ctx.cancel.cancelled() => {
                        return NodeResult::failure(NodeFailure::aborted());
                    }
                }
            };

            finish(&ctx, &names, expected, required, snapshot, timed_out, strategy, handle_missing)
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    ctx: &ExecutionContext,
    names: &[String],
    expected: usize,
    required: usize,
    snapshot: BoardSnapshot,
    timed_out: bool,
    strategy: Strategy,
    handle_missing: HandleMissing,
) -> NodeResult {
    let received = snapshot.arrived.len();
    let met = received >= required;
    let missing: Vec<String> = names
        .iter()
        .filter(|n| !snapshot.has_arrived(n))
        .cloned()
        .collect();

    let arrival: Vec<String> = snapshot.arrived.iter().map(|(n, _)| n.clone()).collect();
    let arrived_entries = |backfill: Option<&Value>| -> Vec<(String, Value)> {
        names
            .iter()
            .filter_map(|n| {
                snapshot
                    .arrived
                    .iter()
                    .find(|(an, _)| an == n)
                    .map(|(_, v)| (n.clone(), v.clone()))
                    .or_else(|| backfill.map(|d| (n.clone(), d.clone())))
            })
            .collect()
    };

    let (entries, partial) = if met {
        (arrived_entries(None), false)
    } else {
        match handle_missing {
            HandleMissing::Error => {
                let kind = if timed_out { ErrorKind::Timeout } else { ErrorKind::Execution };
                return NodeResult::failure(
                    NodeFailure::new(
                        kind,
                        format!(
                            "merge '{}' received {} of {} required branches",
                            ctx.node.id, received, required
                        ),
                    )
                    .with_code("MISSING_BRANCHES"),
                );
            }
            HandleMissing::Ignore => {
                warn!(
                    node_id = %ctx.node.id,
                    received,
                    expected,
                    missing = ?missing,
                    "Merge proceeding with partial results"
                );
                (arrived_entries(None), true)
            }
            HandleMissing::Default => {
                let default = ctx.param("defaultValue").cloned().unwrap_or(Value::Null);
                (arrived_entries(Some(&default)), false)
            }
        }
    };

    let branches: Map<String, Value> = entries.iter().cloned().collect();
    let failed: Map<String, Value> = snapshot
        .failed
        .iter()
        .map(|(n, e)| (n.clone(), Value::String(e.clone())))
        .collect();

    NodeResult::success(json!({
        "merged": aggregate(strategy, &entries, &arrival),
        "partial": partial,
        "received": received,
        "expected": expected,
        "missing": missing,
        "failed": failed,
        "branches": branches,
    }))
}

/// Merge without a paired fork: combine the recorded outputs of the nodes
/// feeding this one.
fn merge_sequential(ctx: &ExecutionContext, strategy: Strategy) -> NodeResult {
    let entries: Vec<(String, Value)> = ctx
        .flow
        .edges
        .iter()
        .filter(|e| e.target == ctx.node.id)
        .filter_map(|e| ctx.node_output(&e.source).map(|v| (e.source.clone(), v)))
        .collect();
    let arrival: Vec<String> = entries.iter().map(|(n, _)| n.clone()).collect();
    let branches: Map<String, Value> = entries.iter().cloned().collect();
    NodeResult::success(json!({
        "merged": aggregate(strategy, &entries, &arrival),
        "partial": false,
        "received": entries.len(),
        "expected": entries.len(),
        "missing": [],
        "failed": {},
        "branches": branches,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<(String, Value)> {
        vec![("a".into(), json!("x")), ("b".into(), json!("y"))]
    }

    #[test]
    fn array_and_object() {
        let arrival = vec!["b".to_string(), "a".to_string()];
        assert_eq!(aggregate(Strategy::Array, &entries(), &arrival), json!(["x", "y"]));
        assert_eq!(aggregate(Strategy::Object, &entries(), &arrival), json!({"a": "x", "b": "y"}));
    }

    #[test]
    fn first_and_last_follow_arrival() {
        let arrival = vec!["b".to_string(), "a".to_string()];
        assert_eq!(aggregate(Strategy::First, &entries(), &arrival), json!("y"));
        assert_eq!(aggregate(Strategy::Last, &entries(), &arrival), json!("x"));
        assert_eq!(aggregate(Strategy::First, &[], &[]), Value::Null);
    }

    #[test]
    fn concat_degrades_on_mixed_types() {
        let arrival = vec![];
        assert_eq!(aggregate(Strategy::Concat, &entries(), &arrival), json!("xy"));
        let arrays = vec![("a".into(), json!([1])), ("b".into(), json!([2, 3]))];
        assert_eq!(aggregate(Strategy::Concat, &arrays, &arrival), json!([1, 2, 3]));
        let mixed = vec![("a".into(), json!("s")), ("b".into(), json!([2]))];
        assert_eq!(aggregate(Strategy::Concat, &mixed, &arrival), json!(["s", [2]]));
    }

    #[test]
    fn validation() {
        assert!(MergeExecutor.validate(&json!({"waitMode": "count", "waitCount": 2, "expectedBranches": 3})).is_empty());
        assert_eq!(MergeExecutor.validate(&json!({"waitMode": "count"})).len(), 1);
        assert_eq!(
            MergeExecutor
                .validate(&json!({"waitMode": "count", "waitCount": 4, "expectedBranches": 3}))
                .len(),
            1
        );
        assert_eq!(MergeExecutor.validate(&json!({"strategy": "zip", "handleMissing": "panic"})).len(), 2);
    }
}
