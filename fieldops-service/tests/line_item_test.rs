//! Line item editing tests.

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
async fn edits_recompute_quote_totals() {
    let app = TestApp::spawn().await;
    let quote = app.create_quote().await;
    let id = quote["quote_id"].as_str().unwrap();
    let path = format!("/quotes/{}/line-items", id);
    let labour_id = quote["line_items"][0]["line_item_id"].clone();

    let response = app
        .put(
            &path,
            json!({
                "changes": [
                    {
                        "action": "add",
                        "item_type": "material",
                        "description": "Circuit breaker",
                        "quantity": "2",
                        "unit_price": "50.00"
                    },
                    { "action": "update", "line_item_id": labour_id, "quantity": "8" }
                ]
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let edited: Value = response.json().await.unwrap();
    assert_eq!(edited["line_items"].as_array().unwrap().len(), 2);
    assert_eq!(money(&edited["subtotal"]), Decimal::new(900, 0));
    assert_eq!(money(&edited["tax_total"]), Decimal::new(90, 0));
    assert_eq!(money(&edited["total"]), Decimal::new(990, 0));
    assert_eq!(money(&edited["deposit_amount"]), Decimal::new(495, 0));

    let response = app
        .put(
            &path,
            json!({ "changes": [ { "action": "remove", "line_item_id": labour_id } ] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let edited: Value = response.json().await.unwrap();
    assert_eq!(edited["line_items"].as_array().unwrap().len(), 1);
    assert_eq!(edited["line_items"][0]["position"], 1);
    assert_eq!(money(&edited["total"]), Decimal::new(110, 0));

    let history: Vec<Value> = app
        .get(&format!("/quotes/{}/activity", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|e| e["action"] == "Line items updated")
            .count(),
        2
    );
}

#[tokio::test]
async fn invalid_edit_changes_nothing() {
    let app = TestApp::spawn().await;
    let quote = app.create_quote().await;
    let id = quote["quote_id"].as_str().unwrap();

    let response = app
        .put(
            &format!("/quotes/{}/line-items", id),
            json!({
                "changes": [
                    {
                        "action": "add",
                        "description": "Site survey",
                        "quantity": "1",
                        "unit_price": "75"
                    },
                    {
                        "action": "add",
                        "description": "Nothing",
                        "quantity": "0",
                        "unit_price": "10"
                    }
                ]
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let stored: Value = app.get(&format!("/quotes/{}", id)).await.json().await.unwrap();
    assert_eq!(stored["line_items"].as_array().unwrap().len(), 1);
    assert_eq!(money(&stored["total"]), Decimal::new(1100, 0));
}

#[tokio::test]
async fn sent_quote_items_are_locked() {
    let app = TestApp::spawn().await;
    let quote = app.create_quote().await;
    let id = quote["quote_id"].as_str().unwrap();
    app.set_status("quotes", id, "sent").await;

    let response = app
        .put(
            &format!("/quotes/{}/line-items", id),
            json!({
                "changes": [
                    {
                        "action": "add",
                        "description": "Late addition",
                        "quantity": "1",
                        "unit_price": "20"
                    }
                ]
            }),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn draft_invoice_items_update_amount_due() {
    let app = TestApp::spawn().await;
    let invoice: Value = app
        .post(
            "/invoices",
            json!({
                "customer_id": app.customer_id(),
                "customer_name": "Harbour Cafe",
                "tax_rate": "5",
                "line_items": [
                    { "description": "Callout fee", "quantity": "1", "unit_price": "80" }
                ]
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(money(&invoice["amount_due"]), Decimal::new(84, 0));

    let response = app
        .put(
            &format!("/invoices/{}/line-items", invoice["invoice_id"].as_str().unwrap()),
            json!({
                "changes": [
                    {
                        "action": "add",
                        "description": "Fuse",
                        "quantity": "4",
                        "unit_price": "5"
                    }
                ]
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let edited: Value = response.json().await.unwrap();
    assert_eq!(money(&edited["subtotal"]), Decimal::new(100, 0));
    assert_eq!(money(&edited["total"]), Decimal::new(105, 0));
    assert_eq!(money(&edited["amount_due"]), Decimal::new(105, 0));
}

#[tokio::test]
async fn invoices_reject_optional_items() {
    let app = TestApp::spawn().await;

    let response = app
        .post(
            "/invoices",
            json!({
                "customer_id": app.customer_id(),
                "customer_name": "Harbour Cafe",
                "line_items": [
                    {
                        "description": "Optional extra",
                        "quantity": "1",
                        "unit_price": "10",
                        "is_optional": true
                    }
                ]
            }),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn concurrent_line_item_edits_are_never_lost() {
    let app = TestApp::spawn().await;
    scenarios::concurrent_line_item_edits_are_never_lost(&app).await;
}
