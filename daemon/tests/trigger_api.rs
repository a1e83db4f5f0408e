//! End-to-end exercises of the trigger surface through the router.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use hydra_daemon::{AppState, DaemonConfig, router};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_state(token: Option<&str>, allowed: Vec<std::path::PathBuf>) -> AppState {
    AppState::new(DaemonConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        token: token.map(str::to_string),
        allowed_paths: allowed,
    })
}

fn app(state: &AppState) -> Router {
    router(state.clone())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn post_trigger(body: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/trigger")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn healthz_needs_no_auth() {
    let state = test_state(Some("s3cret"), Vec::new());
    let (status, body) = send(app(&state), get("/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_the_bearer_token() {
    let state = test_state(Some("s3cret"), Vec::new());

    let (status, body) = send(app(&state), get("/runs", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = send(app(&state), get("/runs", Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(app(&state), get("/runs", Some("s3cret"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn trigger_validates_in_contract_order() {
    let state = test_state(None, Vec::new());

    let cases = [
        (json!({}), "missing_target_path"),
        (json!({"target_path": "/tmp", "mode": "incremental"}), "invalid_mode"),
        (
            json!({"target_path": "/tmp", "head_ref": "HEAD"}),
            "head_ref_requires_base_ref",
        ),
        (
            json!({"target_path": "/tmp", "changed_files": "src/lib.rs"}),
            "changed_files_must_be_array",
        ),
        (
            json!({"target_path": "/tmp", "changed_files": [1, 2]}),
            "changed_files_must_be_array",
        ),
        (
            json!({"target_path": "/definitely/not/here"}),
            "invalid_target_path",
        ),
    ];
    for (body, expected) in cases {
        let (status, reply) = send(app(&state), post_trigger(&body, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {expected}");
        assert_eq!(reply["error"], expected);
    }
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let state = test_state(None, Vec::new());
    let request = Request::builder()
        .method("POST")
        .uri("/trigger")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(app(&state), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_json");
}

#[tokio::test]
async fn oversized_bodies_get_413() {
    let state = test_state(None, Vec::new());
    let huge = format!(
        r#"{{"target_path": "/tmp", "padding": "{}"}}"#,
        "x".repeat(2 * 1024 * 1024)
    );
    let request = Request::builder()
        .method("POST")
        .uri("/trigger")
        .body(Body::from(huge))
        .unwrap();
    let (status, body) = send(app(&state), request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"], "request_too_large");
}

#[tokio::test]
async fn disallowed_paths_are_rejected_without_creating_a_run() {
    let workdir = tempfile::tempdir().unwrap();
    let state = test_state(None, vec![workdir.path().canonicalize().unwrap()]);

    let (status, body) = send(
        app(&state),
        post_trigger(&json!({"target_path": "/etc"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "path_not_allowed");

    let (status, runs) = send(app(&state), get("/runs", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs, json!([]));
}

#[tokio::test]
async fn accepted_trigger_queues_and_completes_a_run() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workdir.path().join("src")).unwrap();
    std::fs::write(
        workdir.path().join("src/lib.rs"),
        "// HYDRA_VULN:missing_signer_check\n",
    )
    .unwrap();
    let canonical = workdir.path().canonicalize().unwrap();
    let state = test_state(None, vec![canonical.clone()]);

    let (status, body) = send(
        app(&state),
        post_trigger(
            &json!({"target_path": canonical, "trigger": "ci"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["mode"], "full");
    let run_id = body["run_id"].as_str().unwrap().to_string();

    // The run executes asynchronously; poll the record until terminal.
    let mut terminal = None;
    for _ in 0..100 {
        let (status, record) = send(app(&state), get(&format!("/runs/{run_id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        let run_status = record["status"].as_str().unwrap().to_string();
        if run_status == "completed" || run_status == "failed" {
            terminal = Some((run_status, record));
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let (run_status, record) = terminal.expect("run never reached a terminal state");
    assert_eq!(run_status, "completed");
    assert_eq!(record["result"]["findings"].as_array().unwrap().len(), 1);

    let (_, runs) = send(app(&state), get("/runs", None)).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_run_ids_are_404() {
    let state = test_state(None, Vec::new());
    let (status, _) = send(
        app(&state),
        get(&format!("/runs/{}", uuid::Uuid::new_v4()), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(app(&state), get("/runs/not-a-uuid", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
