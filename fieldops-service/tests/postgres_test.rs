//! Concurrency suites against PostgreSQL.
//!
//! Each test runs in its own schema and is skipped when `TEST_DATABASE_URL`
//! is unset.

mod common;

use common::{scenarios, TestApp};

#[tokio::test]
async fn concurrent_quote_conversions_create_one_job() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    scenarios::concurrent_quote_conversions_create_one_job(&app).await;
    app.cleanup().await;
}

#[tokio::test]
async fn burst_of_invoice_conversions_creates_one_invoice() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    scenarios::burst_of_invoice_conversions_creates_one_invoice(&app).await;
    app.cleanup().await;
}

#[tokio::test]
async fn duplicate_delivery_records_one_payment() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    scenarios::duplicate_delivery_records_one_payment(&app).await;
    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_redeliveries_share_one_event() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    scenarios::concurrent_redeliveries_share_one_event(&app).await;
    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_events_for_one_payment_record_it_once() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    scenarios::concurrent_events_for_one_payment_record_it_once(&app).await;
    app.cleanup().await;
}

#[tokio::test]
async fn concurrent_line_item_edits_are_never_lost() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    scenarios::concurrent_line_item_edits_are_never_lost(&app).await;
    app.cleanup().await;
}

#[tokio::test]
async fn stored_documents_round_trip_through_the_api() {
    let Some(app) = TestApp::spawn_postgres().await else {
        return;
    };
    let invoice = app.sent_invoice().await;
    assert_eq!(invoice["status"], "sent");
    assert_eq!(scenarios::money(&invoice["total"]), rust_decimal::Decimal::new(1100, 0));
    app.cleanup().await;
}
