use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use conduit_core::config::AppConfig;
use conduit_core::store::DirectoryFlowStore;
use conduit_core::types::RunStatus;
use conduit_engine::{validate_flow, GraphWalker, Services};

const APPROVAL_FLOW: &str = r#"{
    "nodes": [
        {"id": "start", "type": "trigger:manual", "data": {}},
        {"id": "check", "type": "logic:condition",
         "data": {"leftValue": "{{input.amount}}", "operator": ">=", "rightValue": 1000}},
        {"id": "flag", "type": "logic:set_variable", "data": {"variables": {"review": true}}},
        {"id": "pass", "type": "logic:set_variable", "data": {"variables": {"review": false}}}
    ],
    "edges": [
        {"source": "start", "target": "check"},
        {"source": "check", "target": "flag", "label": "true"},
        {"source": "check", "target": "pass", "label": "false"}
    ],
    "variables": {"review": null}
}"#;

#[tokio::test]
async fn test_flow_from_directory_runs_end_to_end() {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::fs::write(dir.path().join("approval.json"), APPROVAL_FLOW).expect("write flow");

    let services = Arc::new(Services::new(Arc::new(DirectoryFlowStore::new(dir.path()))));
    let walker = Arc::new(GraphWalker::with_builtins(AppConfig::default()));

    let flow = services.flows.load("approval").await.expect("load flow");
    assert_eq!(flow.id, "approval");
    assert!(validate_flow(&flow, walker.registry()).is_empty());

    let report = walker
        .run_stored("approval", json!({"amount": 2500}), services.clone(), CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.variables["review"], json!(true));

    let report = walker
        .run_stored("approval", json!({"amount": 10}), services, CancellationToken::new())
        .await
        .expect("run");
    assert_eq!(report.variables["review"], json!(false));
}

#[tokio::test]
async fn test_unknown_node_type_fails_validation() {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::fs::write(
        dir.path().join("broken.json"),
        r#"{"nodes": [{"id": "start", "type": "trigger:manual"}, {"id": "x", "type": "http:request"}],
            "edges": [{"source": "start", "target": "x"}]}"#,
    )
    .expect("write flow");

    let store = DirectoryFlowStore::new(dir.path());
    let services = Services::new(Arc::new(store));
    let flow = services.flows.load("broken").await.expect("load flow");

    let walker = GraphWalker::with_builtins(AppConfig::default());
    let errors = validate_flow(&flow, walker.registry());
    assert_eq!(errors, vec!["x: unknown node type 'http:request'".to_string()]);
}
