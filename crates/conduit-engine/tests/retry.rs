use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use conduit_core::breaker::ConsecutiveFailureBreaker;
use conduit_core::event::EventBus;
use conduit_core::flow::Flow;
use conduit_core::result::ErrorKind;
use conduit_core::store::InMemoryFlowStore;
use conduit_core::types::{FlowEvent, RunStatus};
use conduit_engine::Services;
use conduit_test_utils::{services, test_registry, walker, FailingExecutor, FlakyExecutor, FlowBuilder};

/// start -> retry -> call -> after
fn retry_flow(retry: serde_json::Value) -> FlowBuilder {
    FlowBuilder::new("retrying")
        .trigger()
        .node("retry", "logic:retry", retry)
        .node("call", "test:call", json!({}))
        .node("after", "test:echo", json!({"output": "{{node.call}}"}))
        .edge("start", "retry")
        .edge("retry", "call")
        .edge("call", "after")
}

#[tokio::test(start_paused = true)]
async fn exhausts_exactly_max_retries_with_exponential_delays() {
    let failing = FailingExecutor::new("test:call", ErrorKind::Network);
    let calls = failing.calls();
    let mut registry = test_registry();
    registry.register(failing);

    let bus = Arc::new(EventBus::new(256));
    let mut events = bus.subscribe();
    let services = Arc::new(Services::new(Arc::new(InMemoryFlowStore::new())).with_notifier(bus.clone()));

    let flow = retry_flow(json!({"maxRetries": 3, "baseDelay": 1000, "jitter": false})).build_arc();
    let started = tokio::time::Instant::now();
    let report = walker(registry)
        .run(flow, json!({}), services, CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.status, RunStatus::Failed);
    let error = report.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::RetryExhausted);
    assert_eq!(error.code.as_deref(), Some("NETWORK"));
    assert!(!report.executed("after"));

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3100), "{:?}", elapsed);

    let mut delays = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::RetryScheduled { node_id, delay_ms, .. } = event {
            assert_eq!(node_id, "call");
            delays.push(delay_ms);
        }
    }
    assert_eq!(delays, vec![1000, 2000]);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_and_continue_after_wrapped_node() {
    let flaky = FlakyExecutor::new("test:call", 2);
    let calls = flaky.calls();
    let mut registry = test_registry();
    registry.register(flaky);

    let flow = retry_flow(json!({"maxRetries": 3, "baseDelay": 10})).build_arc();
    let report = walker(registry)
        .run(flow, json!({}), services(InMemoryFlowStore::new()), CancellationToken::new())
        .await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let retry = report.node_output("retry").unwrap();
    assert_eq!(retry["attempts"], 3);
    assert_eq!(retry["history"].as_array().unwrap().len(), 2);
    assert_eq!(report.output, json!({"call": 3}));
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_is_not_retried() {
    let failing = FailingExecutor::new("test:call", ErrorKind::Config);
    let calls = failing.calls();
    let mut registry = test_registry();
    registry.register(failing);

    let flow = retry_flow(json!({"maxRetries": 5})).build_arc();
    let report = walker(registry)
        .run(flow, json!({}), services(InMemoryFlowStore::new()), CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.error.unwrap().kind, ErrorKind::Config);
}

#[tokio::test(start_paused = true)]
async fn deny_listed_code_stops_retrying() {
    let failing = FailingExecutor::new("test:call", ErrorKind::ServerError).with_code("PAYMENT_DECLINED");
    let calls = failing.calls();
    let mut registry = test_registry();
    registry.register(failing);

    let flow = retry_flow(json!({
        "maxRetries": 4,
        "retryOn": ["serverError"],
        "nonRetryableCodes": ["PAYMENT_DECLINED"],
    }))
    .build_arc();
    let report = walker(registry)
        .run(flow, json!({}), services(InMemoryFlowStore::new()), CancellationToken::new())
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.status, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn continue_policy_substitutes_fallback_output() {
    let mut registry = test_registry();
    registry.register(FailingExecutor::new("test:call", ErrorKind::Timeout));

    let flow = retry_flow(json!({
        "maxRetries": 2,
        "baseDelay": 10,
        "onFinalFailure": "continue",
        "fallbackValue": {"status": "degraded"},
    }))
    .build_arc();
    let report = walker(registry)
        .run(flow, json!({}), services(InMemoryFlowStore::new()), CancellationToken::new())
        .await;

    assert!(report.succeeded());
    assert_eq!(report.output, json!({"status": "degraded"}));
    assert_eq!(report.node_output("retry").unwrap()["exhausted"], true);
}

#[tokio::test(start_paused = true)]
async fn fallback_policy_routes_to_fallback_edge() {
    let mut registry = test_registry();
    registry.register(FailingExecutor::new("test:call", ErrorKind::RateLimit));

    let flow = retry_flow(json!({"maxRetries": 2, "baseDelay": 10, "onFinalFailure": "fallback"}))
        .node("cached", "test:echo", json!({"output": "served from cache"}))
        .labeled("retry", "cached", "fallback")
        .build_arc();
    let report = walker(registry)
        .run(flow, json!({}), services(InMemoryFlowStore::new()), CancellationToken::new())
        .await;

    assert!(report.succeeded());
    assert_eq!(report.output, json!("served from cache"));
    assert!(!report.executed("after"));
}

#[tokio::test(start_paused = true)]
async fn open_circuit_skips_the_wrapped_node() {
    let failing = FailingExecutor::new("test:call", ErrorKind::Network);
    let calls = failing.calls();
    let mut registry = test_registry();
    registry.register(failing);
    let walker = walker(registry);

    let breaker = Arc::new(ConsecutiveFailureBreaker::new(1, Duration::from_secs(60)));
    let services = Arc::new(
        Services::new(Arc::new(InMemoryFlowStore::new())).with_circuit_breaker(breaker.clone()),
    );
    let flow: Arc<Flow> = retry_flow(json!({"maxRetries": 1, "circuitKey": "payments"})).build_arc();

    let first = walker
        .run(flow.clone(), json!({}), services.clone(), CancellationToken::new())
        .await;
    assert_eq!(first.status, RunStatus::Failed);
    assert!(breaker.is_open("payments"));

    let second = walker
        .run(flow, json!({}), services, CancellationToken::new())
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.error.unwrap().code.as_deref(), Some("CIRCUIT_OPEN"));
}
