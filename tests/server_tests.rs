use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use nmap_fanout::config::ScanSettings;
use nmap_fanout::coordinator::ScanCoordinator;
use nmap_fanout::server::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(program: &str) -> axum::Router {
    router(ScanCoordinator::new(ScanSettings::default().with_program(program)), None)
}

async fn post_scan(app: axum::Router, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/scan")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

// A missing program would fail with 500, so a 400 proves nothing was launched.
const NEVER_RUN: &str = "/nonexistent/nmap-fanout-scanner";

#[tokio::test]
async fn shell_metacharacters_are_rejected() {
    let (status, body) = post_scan(app(NEVER_RUN), json!({"target": "; rm -rf /"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid target"));
}

#[tokio::test]
async fn disallowed_option_is_rejected() {
    let (status, body) =
        post_scan(app(NEVER_RUN), json!({"target": "10.0.0.1", "options": ["-sS", "-p0"]})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "option not allowed: -p0");
}

#[tokio::test]
async fn bad_ports_are_rejected() {
    let (status, _) = post_scan(app(NEVER_RUN), json!({"target": "10.0.0.1", "ports": "22;id"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn empty_body_is_rejected() {
    let response = app(NEVER_RUN)
        .oneshot(Request::builder().method("POST").uri("/api/scan").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[cfg(unix)]
#[tokio::test]
async fn sync_scan_returns_output_and_command() {
    let (status, body) = post_scan(app("echo"), json!({"target": "10.0.0.1"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "10.0.0.1\n");
    assert_eq!(body["command"], "echo 10.0.0.1");
}

#[cfg(unix)]
#[tokio::test]
async fn sync_scan_failure_is_500() {
    let (status, body) = post_scan(app("false"), json!({"target": "10.0.0.1"})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "scan failed");
}

#[tokio::test]
async fn unknown_scan_is_404() {
    let response = app(NEVER_RUN)
        .oneshot(Request::builder().uri("/api/scans/does-not-exist").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
