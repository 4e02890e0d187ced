//! Quote to job and job to invoice conversion tests.

mod common;

use common::{scenarios, TestApp};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;

fn money(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("money is a string")).unwrap()
}

#[tokio::test]
async fn second_conversion_of_a_quote_is_a_conflict_naming_the_job() {
    let app = TestApp::spawn().await;
    let quote = app.accepted_quote().await;
    let body = json!({ "quote_id": quote["quote_id"] });

    let first = app.post("/jobs/from-quote", body.clone()).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let created: Value = first.json().await.unwrap();
    let job = &created["job"];
    assert_eq!(job["status"], "scheduled");
    assert_eq!(job["quote_id"], quote["quote_id"]);
    assert_eq!(money(&job["quoted_total"]), Decimal::new(1100, 0));

    let second = app.post("/jobs/from-quote", body).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let conflict: Value = second.json().await.unwrap();
    assert_eq!(conflict["existing_job_id"], job["job_id"]);
}

#[tokio::test]
async fn concurrent_quote_conversions_create_one_job() {
    let app = TestApp::spawn().await;
    scenarios::concurrent_quote_conversions_create_one_job(&app).await;
}

#[tokio::test]
async fn burst_of_invoice_conversions_creates_one_invoice() {
    let app = TestApp::spawn().await;
    scenarios::burst_of_invoice_conversions_creates_one_invoice(&app).await;
}

#[tokio::test]
async fn conversion_is_recorded_on_both_documents() {
    let app = TestApp::spawn().await;
    let quote = app.accepted_quote().await;
    let quote_id = quote["quote_id"].as_str().unwrap();

    let created: Value = app
        .post("/jobs/from-quote", json!({ "quote_id": quote_id }))
        .await
        .json()
        .await
        .unwrap();
    let job_id = created["job"]["job_id"].as_str().unwrap();

    let quote_history: Vec<Value> = app
        .get(&format!("/quotes/{}/activity", quote_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(
        quote_history.last().unwrap()["action"],
        format!("Converted to job {}", created["job"]["job_number"].as_str().unwrap())
    );

    let job_history: Vec<Value> = app
        .get(&format!("/jobs/{}/activity", job_id))
        .await
        .json()
        .await
        .unwrap();
    assert!(job_history
        .iter()
        .any(|e| e["action"] == format!("Created from quote {}", quote["quote_number"].as_str().unwrap())));
}

#[tokio::test]
async fn unaccepted_quote_cannot_become_a_job() {
    let app = TestApp::spawn().await;
    let quote = app.create_quote().await;

    let response = app
        .post("/jobs/from-quote", json!({ "quote_id": quote["quote_id"] }))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn completed_job_becomes_one_invoice() {
    let app = TestApp::spawn().await;
    let job = app.completed_job().await;
    let body = json!({ "job_id": job["job_id"] });

    let first = app.post("/invoices/from-job", body.clone()).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let created: Value = first.json().await.unwrap();
    let invoice = &created["invoice"];
    assert_eq!(invoice["status"], "draft");
    assert_eq!(invoice["job_id"], job["job_id"]);
    assert_eq!(invoice["currency"], "USD");
    assert_eq!(money(&invoice["total"]), Decimal::new(1100, 0));
    assert_eq!(money(&invoice["amount_due"]), Decimal::new(1100, 0));
    assert_eq!(invoice["line_items"].as_array().unwrap().len(), 1);

    let invoiced: Value = app
        .get(&format!("/jobs/{}", job["job_id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(invoiced["status"], "invoiced");

    let second = app.post("/invoices/from-job", body).await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let conflict: Value = second.json().await.unwrap();
    assert_eq!(conflict["existing_invoice_id"], invoice["invoice_id"]);
}

#[tokio::test]
async fn scheduled_job_cannot_be_invoiced() {
    let app = TestApp::spawn().await;
    let quote = app.accepted_quote().await;
    let created: Value = app
        .post("/jobs/from-quote", json!({ "quote_id": quote["quote_id"] }))
        .await
        .json()
        .await
        .unwrap();

    let response = app
        .post("/invoices/from-job", json!({ "job_id": created["job"]["job_id"] }))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn other_organizations_cannot_convert_a_job() {
    let app = TestApp::spawn().await;
    let job = app.completed_job().await;

    let response = app
        .client
        .post(format!("{}/invoices/from-job", app.address))
        .header("X-Org-ID", uuid::Uuid::new_v4().to_string())
        .json(&json!({ "job_id": job["job_id"] }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
