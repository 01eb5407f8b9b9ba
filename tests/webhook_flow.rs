#![cfg(unix)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use deploy_listener::signature::compute_signature;
use deploy_listener::{AppState, ListenerConfig, build_router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "test-webhook-secret";
const MAIN_PUSH: &str = r#"{"ref":"refs/heads/main","head_commit":{"id":"abcdef1234","message":"fix","author":{"name":"Alice"}}}"#;

/// Deployment script that records each run in `runs.log` next to itself
fn write_script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("deploy.sh");
    let runs = dir.path().join("runs.log");
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho run >> '{}'\n{}\n", runs.display(), body),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn run_count(dir: &TempDir) -> usize {
    std::fs::read_to_string(dir.path().join("runs.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn app(script: &Path, secret: Option<&str>) -> Router {
    let config = ListenerConfig {
        secret: secret.map(String::from),
        allow_unsigned: secret.is_none(),
        deploy_script: script.to_path_buf(),
        allowed_branches: vec!["main".to_string()],
        deploy_timeout_secs: 10,
        ..Default::default()
    };
    config.validate().unwrap();
    build_router(Arc::new(AppState::new(config)))
}

fn webhook(event: &str, body: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Content-Type", "application/json")
        .header("X-GitHub-Event", event);
    if let Some(signature) = signature {
        builder = builder.header("X-Hub-Signature-256", signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn signed(event: &str, body: &str) -> Request<Body> {
    webhook(event, body, compute_signature(SECRET, body.as_bytes()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn as_json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn health_reports_liveness() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app(&script, Some(SECRET)), request).await;

    assert_eq!(status, StatusCode::OK);
    let body = as_json(&body);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "Webhook Deploy Listener");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn unknown_paths_and_methods_are_not_found() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    for (method, uri) in [
        ("GET", "/"),
        ("GET", "/webhook"),
        ("GET", "/status"),
        ("POST", "/"),
        ("POST", "/health"),
        ("POST", "/webhook/extra"),
        ("PUT", "/webhook"),
        ("DELETE", "/health"),
    ] {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(MAIN_PUSH))
            .unwrap();
        let (status, _) = send(app(&script, Some(SECRET)), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
    }
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn successful_push_deploys_and_reports_commit() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo deployed\nexit 0");

    let (status, body) = send(app(&script, Some(SECRET)), signed("push", MAIN_PUSH)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        as_json(&body),
        json!({
            "status": "success",
            "message": "Deployment triggered successfully",
            "branch": "main",
            "commit": "abcdef1",
        })
    );
    assert_eq!(run_count(&dir), 1);
}

#[tokio::test]
async fn branch_outside_allowlist_is_ignored() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");
    let body = MAIN_PUSH.replace("refs/heads/main", "refs/heads/develop");

    let (status, response) = send(app(&script, Some(SECRET)), signed("push", &body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        as_json(&response),
        json!({"status": "ignored", "reason": "Branch not allowed: develop"})
    );
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn non_string_ref_is_an_ignored_branch() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");
    let body = r#"{"ref":42,"head_commit":{"id":"abcdef1234"}}"#;

    let (status, response) = send(app(&script, Some(SECRET)), signed("push", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        as_json(&response),
        json!({"status": "ignored", "reason": "Branch not allowed: "})
    );
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn non_push_events_are_ignored() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    for event in ["ping", "pull_request", "issues"] {
        let (status, response) = send(app(&script, Some(SECRET)), signed(event, MAIN_PUSH)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            as_json(&response),
            json!({"status": "ignored", "reason": format!("Not a push event: {}", event)})
        );
    }
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn missing_signature_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    // Not even valid JSON: parsing must not be reached
    let (status, body) = send(
        app(&script, Some(SECRET)),
        webhook("push", "{not json", None),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, b"Unauthorized");
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn wrong_signature_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    let forged = compute_signature("not-the-secret", MAIN_PUSH.as_bytes());
    let (status, _) = send(
        app(&script, Some(SECRET)),
        webhook("push", MAIN_PUSH, forged),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn empty_body_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    let (status, body) = send(app(&script, Some(SECRET)), signed("push", "")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"No content");
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    let (status, body) = send(app(&script, Some(SECRET)), signed("push", "{\"ref\":")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"Invalid JSON");
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn failing_script_is_server_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "echo 'disk full' >&2\nexit 1");

    let (status, body) = send(app(&script, Some(SECRET)), signed("push", MAIN_PUSH)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        as_json(&body),
        json!({
            "status": "error",
            "message": "Deployment failed",
            "branch": "main",
            "commit": "abcdef1",
        })
    );
    assert_eq!(run_count(&dir), 1);
}

#[tokio::test]
async fn background_service_does_not_hold_the_delivery() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("service.pid");
    let script = write_script(
        &dir,
        &format!("sleep 30 &\necho $! > '{}'\necho started", pid_file.display()),
    );

    let started = std::time::Instant::now();
    let (status, body) = send(app(&script, Some(SECRET)), signed("push", MAIN_PUSH)).await;
    let elapsed = started.elapsed();

    if let Ok(pid) = std::fs::read_to_string(&pid_file) {
        if let Ok(pid) = pid.trim().parse::<i32>() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "success");
    assert!(elapsed < std::time::Duration::from_secs(8), "{:?}", elapsed);
}

#[tokio::test]
async fn script_removed_after_startup_is_server_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");
    let app = app(&script, Some(SECRET));
    std::fs::remove_file(&script).unwrap();

    let (status, body) = send(app, signed("push", MAIN_PUSH)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(as_json(&body)["status"], "error");
}

#[tokio::test]
async fn timed_out_script_is_server_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "sleep 30");
    let config = ListenerConfig {
        secret: Some(SECRET.to_string()),
        deploy_script: script.clone(),
        allowed_branches: vec!["main".to_string()],
        deploy_timeout_secs: 1,
        ..Default::default()
    };
    let app = build_router(Arc::new(AppState::new(config)));

    let (status, body) = send(app, signed("push", MAIN_PUSH)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(as_json(&body)["message"], "Deployment failed");
}

#[tokio::test]
async fn mistyped_payload_field_is_internal_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");
    let body = r#"{"ref":"refs/heads/main","head_commit":"abcdef1234"}"#;

    let (status, response) = send(app(&script, Some(SECRET)), signed("push", body)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let response = as_json(&response);
    assert_eq!(response["status"], "error");
    assert!(response["message"].as_str().unwrap().contains("invalid type"));
    assert_eq!(run_count(&dir), 0);
}

#[tokio::test]
async fn push_without_head_commit_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");
    let body = r#"{"ref":"refs/heads/main","head_commit":null}"#;

    let (status, response) = send(app(&script, Some(SECRET)), signed("push", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&response)["commit"], "unknown");
}

#[tokio::test]
async fn unsigned_mode_accepts_unsigned_deliveries() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "exit 0");

    let (status, body) = send(app(&script, None), webhook("push", MAIN_PUSH, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(as_json(&body)["status"], "success");
    assert_eq!(run_count(&dir), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_never_overlap() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("in-progress");
    // mkdir fails if another run still holds the marker
    let script = write_script(
        &dir,
        &format!(
            "mkdir '{m}' || exit 3\nsleep 0.2\nrmdir '{m}'",
            m = marker.display()
        ),
    );
    let app = app(&script, Some(SECRET));

    let deliveries: Vec<_> = (0..4)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { send(app, signed("push", MAIN_PUSH)).await })
        })
        .collect();

    for delivery in deliveries {
        let (status, body) = delivery.await.unwrap();
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    }
    assert_eq!(run_count(&dir), 4);
    assert!(!marker.exists());
}
