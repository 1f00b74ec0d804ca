use std::sync::atomic::Ordering;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use conduit_core::flow::Flow;
use conduit_core::result::ErrorKind;
use conduit_core::store::InMemoryFlowStore;
use conduit_core::types::RunStatus;
use conduit_test_utils::{services, test_registry, walker, CountingExecutor, FlowBuilder};

fn parent_with(sub: serde_json::Value) -> Flow {
    FlowBuilder::new("parent")
        .trigger()
        .node("sub", "logic:subflow", sub)
        .node("after", "test:echo", json!({"output": "{{node.sub.output}}"}))
        .edge("start", "sub")
        .edge("sub", "after")
        .variable("shared", json!("parent"))
        .build()
}

#[tokio::test]
async fn recursion_stops_at_max_depth_before_entering_the_child() {
    // start -> work -> recurse(itself)
    let recursive = FlowBuilder::new("recursive")
        .trigger()
        .node("work", "test:work", json!({}))
        .node("recurse", "logic:subflow", json!({"flowId": "recursive", "maxDepth": 2}))
        .edge("start", "work")
        .edge("work", "recurse")
        .build();

    let counter = CountingExecutor::new("test:work");
    let calls = counter.calls();
    let mut registry = test_registry();
    registry.register(counter);

    let store = InMemoryFlowStore::new().with_flow(recursive.clone());
    let report = walker(registry)
        .run(recursive.into(), json!({}), services(store), CancellationToken::new())
        .await;

    // Depths 0, 1 and 2 ran; depth 3 was refused before its first node.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.error.unwrap().kind, ErrorKind::MaxDepthExceeded);
}

#[tokio::test]
async fn isolated_child_sees_no_parent_variables() {
    let child = FlowBuilder::new("child")
        .trigger()
        .node(
            "set",
            "logic:set_variable",
            json!({"variables": {"seen": "{{var.shared}}", "childWrote": true}}),
        )
        .edge("start", "set")
        .build();
    let store = InMemoryFlowStore::new().with_flow(child);

    let parent = parent_with(json!({
        "flowId": "child",
        "variableMode": "isolated",
        "outputMapping": {"seen": "childSeen"},
    }));
    let report = walker(test_registry())
        .run(parent.into(), json!({}), services(store), CancellationToken::new())
        .await;

    assert!(report.succeeded(), "{:?}", report.error);
    assert_eq!(report.variables["childSeen"], json!(""));
    assert!(!report.variables.contains_key("childWrote"));
}

#[tokio::test]
async fn inherit_copies_in_but_does_not_write_back() {
    let child = FlowBuilder::new("child")
        .trigger()
        .node(
            "set",
            "logic:set_variable",
            json!({"variables": {"seen": "{{var.shared}}", "shared": "overwritten"}}),
        )
        .edge("start", "set")
        .build();
    let store = InMemoryFlowStore::new().with_flow(child);

    let parent = parent_with(json!({
        "flowId": "child",
        "variableMode": "inherit",
        "outputMapping": {"seen": "childSeen"},
    }));
    let report = walker(test_registry())
        .run(parent.into(), json!({}), services(store), CancellationToken::new())
        .await;

    assert!(report.succeeded());
    assert_eq!(report.variables["childSeen"], json!("parent"));
    assert_eq!(report.variables["shared"], json!("parent"));
}

#[tokio::test]
async fn shared_writes_propagate_to_the_caller() {
    let child = FlowBuilder::new("child")
        .trigger()
        .node(
            "set",
            "logic:set_variable",
            json!({"variables": {"shared": "{{var.shared}} and child", "childWrote": true}}),
        )
        .edge("start", "set")
        .build();
    let store = InMemoryFlowStore::new().with_flow(child);

    let parent = parent_with(json!({"flowId": "child", "variableMode": "shared"}));
    let report = walker(test_registry())
        .run(parent.into(), json!({}), services(store), CancellationToken::new())
        .await;

    assert!(report.succeeded());
    assert_eq!(report.variables["shared"], json!("parent and child"));
    assert_eq!(report.variables["childWrote"], json!(true));
}

#[tokio::test]
async fn input_mapping_feeds_child_and_output_flows_back() {
    let child = FlowBuilder::new("greeter")
        .trigger()
        .node("greet", "test:echo", json!({"output": "hello {{input.name}} from {{input.team}}"}))
        .edge("start", "greet")
        .build();
    let store = InMemoryFlowStore::new().with_flow(child);

    let parent = FlowBuilder::new("parent")
        .trigger()
        .node(
            "sub",
            "logic:subflow",
            json!({
                "flowId": "greeter",
                "input": {"team": "ops"},
                "inputMapping": {"customer": "name"},
            }),
        )
        .node("after", "test:echo", json!({"output": "{{node.sub.output}}"}))
        .edge("start", "sub")
        .edge("sub", "after")
        .variable("customer", json!("ada"))
        .build();

    let report = walker(test_registry())
        .run(parent.into(), json!({}), services(store), CancellationToken::new())
        .await;

    assert!(report.succeeded());
    assert_eq!(report.output, json!("hello ada from ops"));
}

#[tokio::test(start_paused = true)]
async fn slow_child_times_out() {
    let child = FlowBuilder::new("slow")
        .trigger()
        .node("wait", "test:sleep", json!({"ms": 10_000}))
        .edge("start", "wait")
        .build();
    let store = InMemoryFlowStore::new().with_flow(child);

    let parent = parent_with(json!({"flowId": "slow", "timeoutMs": 100}));
    let report = walker(test_registry())
        .run(parent.into(), json!({}), services(store), CancellationToken::new())
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    let error = report.error.unwrap();
    assert_eq!(error.node_id, "sub");
    assert_eq!(error.kind, ErrorKind::SubflowTimeout);
}

#[tokio::test]
async fn missing_child_can_be_skipped() {
    let parent = parent_with(json!({"flowId": "ghost", "onError": "skip"}));
    let report = walker(test_registry())
        .run(parent.into(), json!({}), services(InMemoryFlowStore::new()), CancellationToken::new())
        .await;

    assert!(report.succeeded());
    assert!(report.executed("after"));
}
