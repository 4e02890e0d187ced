//! Health, readiness, metrics and request context tests.

mod common;

use common::TestApp;
use serde_json::Value;

#[tokio::test]
async fn health_check_returns_ok() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "fieldops-service");
}

#[tokio::test]
async fn readiness_check_returns_ok() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/ready", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn metrics_endpoint_exports_domain_counters() {
    let app = TestApp::spawn().await;
    let quote = app.create_quote().await;
    app.set_status("quotes", quote["quote_id"].as_str().unwrap(), "sent")
        .await;

    let response = app
        .client
        .get(format!("{}/metrics", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("fieldops_transitions_total"));
}

#[tokio::test]
async fn responses_echo_request_id() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .header("x-request-id", "req-42")
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(
        response.headers().get("x-request-id").unwrap().to_str().unwrap(),
        "req-42"
    );
}

#[tokio::test]
async fn document_routes_require_an_organization() {
    let app = TestApp::spawn().await;

    let missing = app
        .client
        .get(format!("{}/quotes/{}", app.address, uuid::Uuid::new_v4()))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(missing.status(), 401);

    let malformed = app
        .client
        .get(format!("{}/quotes/{}", app.address, uuid::Uuid::new_v4()))
        .header("X-Org-ID", "not-a-uuid")
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(malformed.status(), 400);
}
