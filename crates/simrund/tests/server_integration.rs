//! HTTP control plane against a live registry: submit, list, cancel, stream,
//! and purge.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::{config, fake_ssh, registry};
use http_body_util::BodyExt;
use serde_json::Value;
use simrun_core::{RunId, RunState};
use simrund::server::{create_router, AppState};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn create_test_app(dir: &TempDir) -> (axum::Router, Arc<AppState>) {
    let config = config(dir.path(), &fake_ssh(dir.path()));
    let state = Arc::new(AppState {
        registry: Arc::new(registry(&config)),
        config: Arc::new(config),
        auth_token: None,
    });
    (create_router(Arc::clone(&state)), state)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

#[tokio::test]
async fn run_lifecycle_submit_cancel_stream_purge() {
    let dir = TempDir::new().unwrap();
    let (app, state) = create_test_app(&dir);

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(serde_json::json!({
            "executable": {"program": "sh", "args": ["-c", "echo started; sleep 30"]},
            "working_directory": dir.path(),
            "label": "h2o scan",
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let run_id = body_to_json(response).await["run_id"].as_str().unwrap().to_string();

    let response = send(&app, "GET", "/runs?scope=active", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    let runs = json["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["label"], "h2o scan");

    let response = send(&app, "DELETE", &format!("/runs/{run_id}"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = send(&app, "POST", &format!("/runs/{run_id}/cancel"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response).await["outcome"], "requested");

    // The stream closes once the run is terminal.
    let response = send(&app, "GET", &format!("/runs/{run_id}/events"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: state"));
    assert!(text.contains("\"CANCELLED\""));

    let id = RunId::from_string(run_id.clone());
    state.registry.wait_for_completion(&id).await.unwrap();

    let response = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["run"]["state"], "CANCELLED");
    assert!(json["run"]["exit_code"].is_null());

    let response = send(&app, "DELETE", &format!("/runs/{run_id}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_run_reports_cause() {
    let dir = TempDir::new().unwrap();
    let (app, state) = create_test_app(&dir);

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(serde_json::json!({
            "executable": {"program": "sh", "args": ["-c", "exit 7"]},
            "working_directory": dir.path(),
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let run_id = body_to_json(response).await["run_id"].as_str().unwrap().to_string();
    let record = state
        .registry
        .wait_for_completion(&RunId::from_string(run_id.clone()))
        .await
        .unwrap();
    assert_eq!(record.state, RunState::Failed);

    let response = send(&app, "GET", "/runs?scope=terminal", None).await;
    let json = body_to_json(response).await;
    let run = &json["runs"][0];
    assert_eq!(run["id"], run_id.as_str());
    assert_eq!(run["exit_code"], 7);
    assert_eq!(run["cause"], "process exited with code 7");
}

#[tokio::test]
async fn missing_working_directory_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (app, state) = create_test_app(&dir);

    let response = send(
        &app,
        "POST",
        "/runs",
        Some(serde_json::json!({
            "executable": {"program": "echo", "args": ["x"]},
            "working_directory": dir.path().join("absent"),
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_to_json(response).await["error"].as_str().unwrap().contains("working directory"));
    assert!(state.registry.is_empty());
}
