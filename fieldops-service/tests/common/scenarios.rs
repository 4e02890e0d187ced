//! Concurrency scenarios shared by the in-memory and PostgreSQL suites.

use super::TestApp;
use futures::future::join_all;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use uuid::Uuid;

pub fn money(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("money is a string")).unwrap()
}

pub fn payment_event(event_id: &str, org_id: Uuid, invoice_id: &str, amount: &str) -> String {
    json!({
        "id": event_id,
        "type": "payment.succeeded",
        "data": {
            "org_id": org_id.to_string(),
            "invoice_id": invoice_id,
            "amount": amount
        }
    })
    .to_string()
}

async fn invoice(app: &TestApp, invoice_id: &str) -> Value {
    app.get(&format!("/invoices/{}", invoice_id))
        .await
        .json()
        .await
        .unwrap()
}

pub async fn concurrent_quote_conversions_create_one_job(app: &TestApp) {
    let quote = app.accepted_quote().await;
    let body = json!({ "quote_id": quote["quote_id"] });

    let (a, b) = tokio::join!(
        app.post("/jobs/from-quote", body.clone()),
        app.post("/jobs/from-quote", body.clone())
    );
    let mut statuses = vec![a.status(), b.status()];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::CREATED, StatusCode::CONFLICT]);

    let a: Value = a.json().await.unwrap();
    let b: Value = b.json().await.unwrap();
    let created_id = a["job"]["job_id"].as_str().or(b["job"]["job_id"].as_str());
    let existing_id = a["existing_job_id"]
        .as_str()
        .or(b["existing_job_id"].as_str());
    assert!(created_id.is_some());
    assert_eq!(created_id, existing_id);
}

pub async fn burst_of_invoice_conversions_creates_one_invoice(app: &TestApp) {
    let job = app.completed_job().await;
    let body = json!({ "job_id": job["job_id"] });

    let responses = join_all((0..4).map(|_| app.post("/invoices/from-job", body.clone()))).await;

    let created = responses
        .iter()
        .filter(|r| r.status() == StatusCode::CREATED)
        .count();
    let conflicts = responses
        .iter()
        .filter(|r| r.status() == StatusCode::CONFLICT)
        .count();
    assert_eq!(created, 1);
    assert_eq!(conflicts, 3);
}

pub async fn duplicate_delivery_records_one_payment(app: &TestApp) {
    let sent = app.sent_invoice().await;
    let invoice_id = sent["invoice_id"].as_str().unwrap();
    let body = payment_event("evt_dup", app.org_id, invoice_id, "400.00");

    let first: Value = app
        .deliver_webhook("stripe", &body, None)
        .await
        .json()
        .await
        .unwrap();
    let second: Value = app
        .deliver_webhook("stripe", &body, None)
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(first["status"], "processed");
    assert_eq!(second["status"], "processed");
    assert_eq!(first["webhook_event_id"], second["webhook_event_id"]);

    let partial = invoice(app, invoice_id).await;
    assert_eq!(partial["status"], "sent");
    assert_eq!(money(&partial["amount_paid"]), Decimal::new(400, 0));
    assert_eq!(money(&partial["amount_due"]), Decimal::new(700, 0));
}

/// The same event delivered several times at once lands as a single event.
pub async fn concurrent_redeliveries_share_one_event(app: &TestApp) {
    let sent = app.sent_invoice().await;
    let invoice_id = sent["invoice_id"].as_str().unwrap();
    let body = payment_event("evt_burst", app.org_id, invoice_id, "250.00");

    let responses = join_all((0..4).map(|_| app.deliver_webhook("stripe", &body, None))).await;
    let mut event_ids = Vec::new();
    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        let ack: Value = response.json().await.unwrap();
        event_ids.push(ack["webhook_event_id"].as_str().unwrap().to_string());
    }
    event_ids.sort();
    event_ids.dedup();
    assert_eq!(event_ids.len(), 1);

    let events: Vec<Value> = app
        .client
        .get(format!("{}/webhooks/events?source=stripe&limit=1000", app.address))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let matching = events
        .iter()
        .filter(|e| e["external_event_id"] == "evt_burst")
        .count();
    assert_eq!(matching, 1);
    assert_eq!(money(&invoice(app, invoice_id).await["amount_paid"]), Decimal::new(250, 0));
}

/// Separate events carrying one provider payment reference record one payment.
pub async fn concurrent_events_for_one_payment_record_it_once(app: &TestApp) {
    let sent = app.sent_invoice().await;
    let invoice_id = sent["invoice_id"].as_str().unwrap();
    let event = |id: &str| {
        json!({
            "id": id,
            "type": "payment.succeeded",
            "data": {
                "org_id": app.org_id.to_string(),
                "invoice_id": invoice_id,
                "amount": "300.00",
                "payment_id": "pay_shared"
            }
        })
        .to_string()
    };
    let (first, second) = (event("evt_a"), event("evt_b"));

    let (a, b) = tokio::join!(
        app.deliver_webhook("stripe", &first, None),
        app.deliver_webhook("stripe", &second, None)
    );
    let a: Value = a.json().await.unwrap();
    let b: Value = b.json().await.unwrap();
    assert_ne!(a["webhook_event_id"], b["webhook_event_id"]);
    assert_eq!(a["status"], "processed");
    assert_eq!(b["status"], "processed");

    let settled = invoice(app, invoice_id).await;
    assert_eq!(money(&settled["amount_paid"]), Decimal::new(300, 0));
    assert_eq!(money(&settled["amount_due"]), Decimal::new(800, 0));
}

/// Concurrent edits of one draft either apply or are refused; none is lost.
pub async fn concurrent_line_item_edits_are_never_lost(app: &TestApp) {
    let quote = app.create_quote().await;
    let path = format!("/quotes/{}/line-items", quote["quote_id"].as_str().unwrap());
    let edit = |description: &str| {
        json!({
            "changes": [
                { "action": "add", "description": description, "quantity": "1", "unit_price": "10" }
            ]
        })
    };

    let responses = join_all(
        ["Breaker", "Conduit", "Junction box", "Cable ties"]
            .iter()
            .map(|description| app.put(&path, edit(description))),
    )
    .await;
    let mut applied = 0;
    for response in responses {
        match response.status() {
            StatusCode::OK => applied += 1,
            StatusCode::BAD_REQUEST => {
                let body: Value = response.json().await.unwrap();
                assert!(body["error"].as_str().unwrap().contains("reload and retry"));
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert!(applied >= 1);

    let stored: Value = app
        .get(&format!("/quotes/{}", quote["quote_id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    let items = stored["line_items"].as_array().unwrap();
    assert_eq!(items.len(), 1 + applied);
    // 10 x 100.00 labour plus 10.00 per applied edit, at 10% tax
    let subtotal = Decimal::new(1000, 0) + Decimal::new(10, 0) * Decimal::from(applied as u64);
    assert_eq!(money(&stored["subtotal"]), subtotal);
}
