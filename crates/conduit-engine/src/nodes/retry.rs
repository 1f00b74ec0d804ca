use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use conduit_core::result::{ErrorKind, Next, NodeFailure, NodeResult};
use conduit_core::types::FlowEvent;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;
use crate::nodes::{string_list, wrapped_target};
use crate::sleep::sleep_cancellable;
use crate::walker::route_after;

/// Handle taken when attempts are exhausted under `onFinalFailure: fallback`.
pub const FALLBACK_HANDLE: &str = "fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
}

impl BackoffStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "constant" | "fixed" => Some(Self::Constant),
            "linear" => Some(Self::Linear),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Delay before the retry that follows failed attempt `attempt` (1-based), before jitter.
///
/// `exponential` is `min(max_delay, base × 2^(attempt-1))`.
pub fn backoff_delay(strategy: BackoffStrategy, base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let attempt = attempt.max(1);
    let raw = match strategy {
        BackoffStrategy::Constant => base_ms,
        BackoffStrategy::Linear => base_ms.saturating_mul(attempt as u64),
        BackoffStrategy::Exponential => {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            base_ms.saturating_mul(factor)
        }
    };
    raw.min(max_ms)
}

/// Perturb a delay by a factor in 0.8..=1.2. Never negative.
pub fn apply_jitter(delay_ms: u64) -> u64 {
    let factor = 0.8 + rand::random::<f64>() * 0.4;
    (delay_ms as f64 * factor).max(0.0) as u64
}

/// One failed attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Bookkeeping of one retry invocation.
#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl RetryState {
    fn to_json(&self) -> Value {
        json!({
            "attempts": self.attempts,
            "history": self.history,
            "elapsedMs": self.elapsed.as_millis() as u64,
        })
    }
}

/// Whether a failure may be retried under the configured categories and deny-list.
///
/// Safety limits, cancellation and configuration errors are never retried. An
/// empty category list falls back to the failure's own `recoverable` flag.
pub fn is_retryable(failure: &NodeFailure, retry_on: &[String], deny: &[String]) -> bool {
    if failure.kind.is_safety_limit()
        || matches!(failure.kind, ErrorKind::Aborted | ErrorKind::Config)
    {
        return false;
    }
    if deny.iter().any(|code| failure.matches_code(code)) {
        return false;
    }
    if retry_on.is_empty() {
        return failure.recoverable;
    }
    retry_on.iter().any(|category| match category.as_str() {
        "all" => true,
        "timeout" => failure.kind == ErrorKind::Timeout,
        "network" => failure.kind == ErrorKind::Network,
        "rateLimit" => failure.kind == ErrorKind::RateLimit,
        "serverError" => failure.kind == ErrorKind::ServerError,
        "transient" => failure.kind == ErrorKind::Transient || failure.recoverable,
        _ => false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalPolicy {
    Fail,
    Continue,
    Fallback,
}

/// Wraps the single node on its default edge and re-invokes it on retryable failure.
pub struct RetryExecutor;

impl NodeExecutor for RetryExecutor {
    fn node_type(&self) -> &str {
        "logic:retry"
    }

    fn description(&self) -> &str {
        "Retries the wrapped node with backoff"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(v) = config.get("maxRetries") {
            if v.as_u64().map_or(true, |n| n == 0) {
                errors.push("maxRetries must be a positive integer".to_string());
            }
        }
        if let Some(s) = config.get("backoffStrategy").and_then(|v| v.as_str()) {
            if BackoffStrategy::parse(s).is_none() {
                errors.push(format!("unknown backoffStrategy '{}'", s));
            }
        }
        if let Some(p) = config.get("onFinalFailure").and_then(|v| v.as_str()) {
            if !["fail", "continue", "fallback"].contains(&p) {
                errors.push(format!("unknown onFinalFailure '{}'", p));
            }
        }
        if let (Some(base), Some(max)) = (
            config.get("baseDelay").and_then(|v| v.as_u64()),
            config.get("maxDelay").and_then(|v| v.as_u64()),
        ) {
            if base > max {
                errors.push(format!("baseDelay {} exceeds maxDelay {}", base, max));
            }
        }
        const CATEGORIES: &[&str] =
            &["all", "timeout", "network", "rateLimit", "serverError", "transient"];
        for category in string_list(config.get("retryOn")) {
            if !CATEGORIES.contains(&category.as_str()) {
                errors.push(format!("unknown retryOn category '{}'", category));
            }
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let wrapped = match wrapped_target(&ctx.flow, &ctx.node.id) {
                Ok(id) => id,
                Err(f) => return NodeResult::failure(f),
            };

            let defaults = &ctx.engine.config().retry;
            let max_attempts = ctx
                .param_u64("maxRetries")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_retries)
                .max(1);
            let strategy = ctx
                .param_str("backoffStrategy")
                .and_then(BackoffStrategy::parse)
                .unwrap_or(BackoffStrategy::Exponential);
            let base_ms = ctx.param_u64("baseDelay").unwrap_or(defaults.base_delay_ms);
            let max_ms = ctx.param_u64("maxDelay").unwrap_or(defaults.max_delay_ms);
            let jitter = ctx.param_bool("jitter").unwrap_or(defaults.jitter);
            let retry_on = string_list(ctx.param("retryOn"));
            let deny = string_list(ctx.param("nonRetryableCodes"));
            let policy = match ctx.param_str("onFinalFailure") {
                Some("continue") => FinalPolicy::Continue,
                Some("fallback") => FinalPolicy::Fallback,
                _ => FinalPolicy::Fail,
            };
            let circuit_key = ctx
                .param_str("circuitKey")
                .unwrap_or(wrapped.as_str())
                .to_string();
            let breaker = ctx.services.circuit_breaker.clone();

            let started = Instant::now();
            let mut state = RetryState::default();

            if let Some(b) = &breaker {
                if !b.can_execute(&circuit_key) {
                    warn!(node_id = %ctx.node.id, key = %circuit_key, "Circuit open, skipping execution");
                    let failure = NodeFailure::new(
                        ErrorKind::Execution,
                        format!("circuit '{}' is open", circuit_key),
                    )
                    .with_code("CIRCUIT_OPEN")
                    .with_recoverable(false);
                    return final_failure(&ctx, &wrapped, policy, &state, failure);
                }
            }

            let last_failure = loop {
                state.attempts += 1;
                let result = ctx.engine.execute_node(&ctx, &wrapped).await;

                let failure = match result {
                    NodeResult::Success { output, next } => {
                        if let Some(b) = &breaker {
                            b.record_success(&circuit_key);
                        }
                        state.elapsed = started.elapsed();
                        if state.attempts > 1 {
                            info!(node_id = %ctx.node.id, wrapped = %wrapped, attempts = state.attempts, "Retry succeeded");
                        }
                        let mut out = state.to_json();
                        out["output"] = output;
                        return NodeResult::route(out, route_after(&ctx.flow, &wrapped, next));
                    }
                    NodeResult::Skip { reason } => {
                        return NodeResult::route(
                            json!({"skipped": reason, "attempts": state.attempts}),
                            Next::After(wrapped),
                        );
                    }
                    NodeResult::Failure(f) => f,
                };

                if let Some(b) = &breaker {
                    b.record_failure(&circuit_key);
                }
                state.history.push(AttemptRecord {
                    attempt: state.attempts,
                    error: failure.to_string(),
                    timestamp: Utc::now(),
                });

                if failure.kind == ErrorKind::Aborted {
                    return NodeResult::failure(failure);
                }
                if !is_retryable(&failure, &retry_on, &deny) {
                    state.elapsed = started.elapsed();
                    return final_failure(&ctx, &wrapped, policy, &state, failure);
                }
                if state.attempts >= max_attempts {
                    break failure;
                }

                let mut delay = backoff_delay(strategy, base_ms, max_ms, state.attempts);
                if jitter {
                    delay = apply_jitter(delay);
                }
                warn!(
                    node_id = %ctx.node.id,
                    wrapped = %wrapped,
                    attempt = state.attempts,
                    max_attempts,
                    delay_ms = delay,
                    error = %failure,
                    "Retrying node"
                );
                ctx.notify(FlowEvent::RetryScheduled {
                    execution_id: ctx.execution_id.clone(),
                    node_id: wrapped.clone(),
                    attempt: state.attempts,
                    delay_ms: delay,
                    error: failure.message.clone(),
                });

                if !sleep_cancellable(Duration::from_millis(delay), &ctx.cancel).await {
                    return NodeResult::failure(NodeFailure::aborted());
                }
            };

            state.elapsed = started.elapsed();
            let exhausted = NodeFailure::new(
                ErrorKind::RetryExhausted,
                format!(
                    "'{}' failed after {} attempts: {}",
                    wrapped, state.attempts, last_failure.message
                ),
            )
            .with_code(last_failure.kind.code());
            final_failure(&ctx, &wrapped, policy, &state, exhausted)
        })
    }
}

/// Apply `onFinalFailure` once retrying stops.
fn final_failure(
    ctx: &ExecutionContext,
    wrapped: &str,
    policy: FinalPolicy,
    state: &RetryState,
    failure: NodeFailure,
) -> NodeResult {
    let mut out = state.to_json();
    out["error"] = failure.to_json();

    match policy {
        FinalPolicy::Fail => NodeResult::failure(failure),
        FinalPolicy::Continue => {
            let fallback = ctx.param("fallbackValue").cloned().unwrap_or(Value::Null);
            ctx.set_output(wrapped, fallback.clone());
            out["output"] = fallback;
            out["exhausted"] = Value::Bool(true);
            NodeResult::route(out, Next::After(wrapped.to_string()))
        }
        FinalPolicy::Fallback => {
            out["exhausted"] = Value::Bool(true);
            NodeResult::handle(out, FALLBACK_HANDLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let d = |n| backoff_delay(BackoffStrategy::Exponential, 1000, 30_000, n);
        assert_eq!(d(1), 1000);
        assert_eq!(d(2), 2000);
        assert_eq!(d(3), 4000);
        assert_eq!(d(6), 30_000);
        assert_eq!(d(80), 30_000);
    }

    #[test]
    fn constant_and_linear() {
        assert_eq!(backoff_delay(BackoffStrategy::Constant, 500, 10_000, 4), 500);
        assert_eq!(backoff_delay(BackoffStrategy::Linear, 500, 10_000, 4), 2000);
        assert_eq!(backoff_delay(BackoffStrategy::Linear, 500, 1000, 4), 1000);
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..200 {
            let d = apply_jitter(1000);
            assert!((800..=1200).contains(&d), "{}", d);
        }
        assert_eq!(apply_jitter(0), 0);
    }

    #[test]
    fn retryability() {
        let timeout = NodeFailure::timeout("slow");
        let none: Vec<String> = vec![];
        assert!(is_retryable(&timeout, &none, &none));
        assert!(is_retryable(&timeout, &["timeout".into()], &none));
        assert!(!is_retryable(&timeout, &["network".into()], &none));
        assert!(!is_retryable(&timeout, &["all".into()], &["TIMEOUT".into()]));

        let auth = NodeFailure::new(ErrorKind::Execution, "denied").with_code("AUTH_FAILED");
        assert!(!is_retryable(&auth, &none, &none));
        assert!(is_retryable(&auth, &["all".into()], &none));
        assert!(!is_retryable(&auth, &["all".into()], &["auth_failed".into()]));

        let deep = NodeFailure::new(ErrorKind::MaxDepthExceeded, "deep");
        assert!(!is_retryable(&deep, &["all".into()], &none));
        assert!(!is_retryable(&NodeFailure::aborted(), &["all".into()], &none));
    }

    #[test]
    fn validation() {
        assert!(RetryExecutor
            .validate(&json!({"maxRetries": 3, "backoffStrategy": "exponential", "baseDelay": 1000}))
            .is_empty());
        assert_eq!(RetryExecutor.validate(&json!({"maxRetries": 0})).len(), 1);
        assert_eq!(
            RetryExecutor
                .validate(&json!({"baseDelay": 5000, "maxDelay": 100, "retryOn": ["cosmic"]}))
                .len(),
            2
        );
    }
}
