
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use benchfleet::agent::ExecutionCoordinator;
use benchfleet::api::agent::AgentState;
use benchfleet::api::center::CenterState;
use benchfleet::config::{AgentConfig, LeaseConfig};
use benchfleet::lease::MachineLeaseManager;
use benchfleet::orchestrator::Orchestrator;
use test_harness::{execution_config, registry_with, write_case, FakeAgent};

const HOST: &str = "10.0.0.5";

async fn center_app() -> Router {
    let (registry, _probe) = registry_with(&[HOST]).await;
    let leases = Arc::new(MachineLeaseManager::new(LeaseConfig::in_memory(60_000)));
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        leases.clone(),
        FakeAgent::new(),
    ));
    benchfleet::api::center::router(CenterState {
        leases,
        registry,
        orchestrator,
    })
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

fn acquire_body(holder: &str, name: &str) -> Value {
    json!({
        "address": HOST,
        "holder_id": holder,
        "holder_name": name,
        "test_case": "basic_test.py",
        "port": "COM1",
    })
}

#[tokio::test]
async fn test_center_health() {
    let app = center_app().await;
    let (status, body) = call(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], "ok");
}

#[tokio::test]
async fn test_lease_endpoints() {
    let app = center_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/leases/acquire",
        Some(acquire_body("u1", "Alice")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "成功获取测试机 10.0.0.5 使用权");
    assert_eq!(body["data"]["lease"]["holder_id"], "u1");
    assert_eq!(body["data"]["lease"]["mode"], "automatic");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/leases/acquire",
        Some(acquire_body("u2", "Bob")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "HOST_BUSY");
    assert_eq!(body["message"], "测试机正在被用户 Alice 使用");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/leases/release",
        Some(json!({"address": HOST, "holder_id": "u2"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "NO_PERMISSION");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/leases/heartbeat",
        Some(json!({"address": HOST, "holder_id": "u1", "run_id": "test_1_0"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["lease"]["run_id"], "test_1_0");

    let (_, body) = call(&app, Method::GET, "/api/leases/10.0.0.5", None).await;
    assert_eq!(body["data"]["state"], "busy");
    assert_eq!(body["data"]["available"], false);

    let (_, body) = call(&app, Method::GET, "/api/holders/u1/sessions", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/leases/force_release",
        Some(json!({"address": HOST, "admin": "root"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("root"));

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/leases/release",
        Some(json!({"address": HOST, "holder_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "LEASE_NOT_FOUND");
}

#[tokio::test]
async fn test_release_all_endpoint() {
    let app = center_app().await;
    call(&app, Method::POST, "/api/leases/acquire", Some(acquire_body("u1", "Alice"))).await;
    call(
        &app,
        Method::POST,
        "/api/leases/acquire",
        Some(json!({"address": "10.0.0.6", "holder_id": "u1", "holder_name": "Alice", "manual": true})),
    )
    .await;

    let (status, body) = call(&app, Method::POST, "/api/holders/u1/release_all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["10.0.0.5", "10.0.0.6"]));

    let (_, body) = call(&app, Method::GET, "/api/leases", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_machine_endpoints() {
    let app = center_app().await;

    let (status, body) = call(&app, Method::GET, "/api/machines", None).await;
    assert_eq!(status, StatusCode::OK);
    let machines = body["data"].as_array().unwrap();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0]["address"], HOST);
    assert_eq!(machines[0]["machine"]["reachable"], true);
    assert_eq!(machines[0]["lease"]["state"], "idle");

    let (status, body) = call(&app, Method::GET, "/api/machines/10.0.0.5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["machine"]["origin"], "manual");

    let (status, body) = call(&app, Method::GET, "/api/machines/10.0.0.99", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "HOST_NOT_FOUND");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/machines",
        Some(json!({"address": "bench-7", "name": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ADDRESS");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/machines",
        Some(json!({"address": HOST})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "HOST_EXISTS");

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/machines/10.0.0.5",
        Some(json!({"address": HOST, "name": "Rack 5", "location": "lab-2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["display_name"], "Rack 5");

    let (status, _) = call(&app, Method::POST, "/api/machines/10.0.0.5/refresh", None).await;
    assert_eq!(status, StatusCode::OK);

    // First the manual declaration goes, then the discovered record.
    let (status, _) = call(&app, Method::DELETE, "/api/machines/10.0.0.5", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::DELETE, "/api/machines/10.0.0.5", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, Method::GET, "/api/machines/10.0.0.5", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "HOST_NOT_FOUND");
    let (status, body) = call(&app, Method::DELETE, "/api/machines/10.0.0.5", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "HOST_NOT_FOUND");
}

#[tokio::test]
async fn test_run_endpoints() {
    let app = center_app().await;
    let run_body = json!({
        "holder_id": "u1",
        "holder_name": "Alice",
        "test_case": "basic_test.py",
        "port": "COM1",
    });

    let (status, body) = call(&app, Method::POST, "/api/machines/10.0.0.5/runs", Some(run_body.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "LEASE_NOT_FOUND");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/machines/10.0.0.5/acquire_and_run",
        Some(run_body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let run_id = body["data"]["run"]["run_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["lease"]["run_id"], run_id.as_str());

    let uri = format!("/api/machines/10.0.0.5/runs/{}", run_id);
    let (status, body) = call(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "running");

    let (status, body) = call(&app, Method::GET, &format!("{}/logs?after=3", uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["next_cursor"], 3);

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("{}/stop", uri),
        Some(json!({"holder_id": "u2"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "NO_PERMISSION");

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("{}/stop", uri),
        Some(json!({"holder_id": "u1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "stopped");
}

// =============================================================================
// Agent API
// =============================================================================

#[tokio::test]
async fn test_agent_endpoints() {
    let cases = tempfile::tempdir().unwrap();
    let flags = tempfile::tempdir().unwrap();
    write_case(cases.path(), "basic_test.py", "echo hello\nsleep 30");

    let config = AgentConfig {
        location: Some("lab-3".to_string()),
        execution: execution_config(cases.path(), flags.path()),
        ..AgentConfig::default()
    };
    let coordinator = Arc::new(ExecutionCoordinator::new(config.execution.clone()));
    let app = benchfleet::api::agent::router(AgentState {
        coordinator,
        config: Arc::new(config),
    });

    let (status, body) = call(&app, Method::GET, "/api/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["location"], "lab-3");
    assert!(!body["data"]["hostname"].as_str().unwrap().is_empty());

    let (_, body) = call(&app, Method::GET, "/api/cases", None).await;
    assert_eq!(body["data"][0]["name"], "basic_test.py");

    let (status, body) = call(&app, Method::GET, "/api/ports", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_array());

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/runs",
        Some(json!({"test_case": "missing_case.py", "port": "COM1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CASE_NOT_FOUND");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/runs",
        Some(json!({"test_case": "basic_test.py", "port": "COM1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "测试已开始执行");
    let run_id = body["data"]["run_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (_, body) = call(&app, Method::GET, &format!("/api/runs/{}/logs?after=0", run_id), None).await;
    let lines = body["data"]["lines"].as_array().unwrap();
    assert!(lines.iter().any(|l| l["text"] == "hello" && l["stream"] == "stdout"));

    let (_, body) = call(&app, Method::GET, "/api/runs", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = call(&app, Method::POST, &format!("/api/runs/{}/stop", run_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "stopped");

    let (status, body) = call(&app, Method::POST, &format!("/api/runs/{}/stop", run_id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "RUN_FINISHED");

    let (status, body) = call(&app, Method::GET, "/api/runs/test_0_404", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "RUN_NOT_FOUND");
}
