//! Test helper module for fieldops-service integration tests.
//!
//! Spawns the real HTTP server on a random port, over the in-memory store or,
//! when `TEST_DATABASE_URL` is set, over PostgreSQL in a schema per test.

#![allow(dead_code)]

pub mod scenarios;

use fieldops_service::config::{DatabaseConfig, FieldOpsConfig};
use fieldops_service::services::{init_metrics, Database, LogNotifier, MemoryStore, Notifier, Store};
use fieldops_service::startup::Application;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const TEST_CUSTOMER_ID: &str = "22222222-2222-2222-2222-222222222222";

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Database URL for PostgreSQL-backed tests, if one is configured.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok()
}

/// Generate a unique schema name for test isolation.
fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_fieldops_{}_{}", std::process::id(), counter)
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub org_id: Uuid,
    pub store: Arc<dyn Store>,
    pub client: reqwest::Client,
    schema_name: Option<String>,
}

impl TestApp {
    /// Spawn a new test application on a random port.
    pub async fn spawn() -> Self {
        Self::spawn_with(FieldOpsConfig::local(0), Arc::new(LogNotifier)).await
    }

    pub async fn spawn_with(config: FieldOpsConfig, notifier: Arc<dyn Notifier>) -> Self {
        init_metrics();

        let store = Arc::new(MemoryStore::new());
        let app = Application::build_with(config, store.clone(), notifier)
            .await
            .expect("Failed to build test application");
        Self::launch(app, store, None).await
    }

    /// Spawn against PostgreSQL in a fresh schema. `None` when no test database is configured.
    pub async fn spawn_postgres() -> Option<Self> {
        let Some(base_url) = get_test_database_url() else {
            eprintln!("TEST_DATABASE_URL is not set; skipping PostgreSQL test");
            return None;
        };
        init_metrics();
        let schema_name = unique_schema_name();

        // Create schema for test isolation
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");
        pool.close().await;

        // Use ? or & depending on whether URL already has query parameters
        let separator = if base_url.contains('?') { "&" } else { "?" };
        let url = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let mut config = FieldOpsConfig::local(0);
        config.log_level = "warn".to_string();
        config.database = Some(DatabaseConfig {
            url: url.clone(),
            max_connections: 10,
            min_connections: 1,
        });

        // Application::build connects and runs migrations into the schema
        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let db = Database::new(&url, 2, 1)
            .await
            .expect("Failed to create test database");

        Some(Self::launch(app, Arc::new(db), Some(schema_name)).await)
    }

    async fn launch(app: Application, store: Arc<dyn Store>, schema_name: Option<String>) -> Self {
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling the health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            port,
            org_id: Uuid::new_v4(),
            store,
            client,
            schema_name,
        }
    }

    /// Cleanup test resources (schema).
    pub async fn cleanup(&self) {
        let (Some(schema_name), Some(base_url)) = (&self.schema_name, get_test_database_url()) else {
            return;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
                .execute(&pool)
                .await;
            pool.close().await;
        }
    }

    pub fn customer_id(&self) -> Uuid {
        Uuid::parse_str(TEST_CUSTOMER_ID).unwrap()
    }

    /// Request scoped to this app's organization.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.address, path))
            .header("X-Org-ID", self.org_id.to_string())
    }

    pub async fn get(&self, path: &str) -> Response {
        self.request(Method::GET, path)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post(&self, path: &str, body: Value) -> Response {
        self.request(Method::POST, path)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn patch(&self, path: &str, body: Value) -> Response {
        self.request(Method::PATCH, path)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn put(&self, path: &str, body: Value) -> Response {
        self.request(Method::PUT, path)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete(&self, path: &str) -> Response {
        self.request(Method::DELETE, path)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Deliver a raw webhook body, optionally signed.
    pub async fn deliver_webhook(
        &self,
        source: &str,
        body: &str,
        signature: Option<&str>,
    ) -> Response {
        let mut request = self
            .client
            .post(format!("{}/webhooks/{}", self.address, source))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header("X-Webhook-Signature", signature);
        }
        request.send().await.expect("Failed to execute request")
    }

    // ==================== Document fixtures ====================

    /// Draft quote with one 10 x 100.00 labour line at 10% tax.
    pub async fn create_quote(&self) -> Value {
        let response = self
            .post(
                "/quotes",
                json!({
                    "customer_id": self.customer_id(),
                    "customer_name": "Harbour Cafe",
                    "customer_email": "owner@harbourcafe.test",
                    "title": "Kitchen rewiring",
                    "tax_rate": "10",
                    "deposit": { "type": "percentage", "value": "50" },
                    "line_items": [
                        {
                            "item_type": "labor",
                            "description": "Electrician hours",
                            "quantity": "10",
                            "unit": "hour",
                            "unit_price": "100.00"
                        }
                    ]
                }),
            )
            .await;
        assert_eq!(response.status(), 201);
        response.json().await.unwrap()
    }

    pub async fn set_status(&self, kind: &str, id: &str, status: &str) -> Response {
        self.patch(&format!("/{}/{}/status", kind, id), json!({ "status": status }))
            .await
    }

    /// Quote walked through sent to accepted.
    pub async fn accepted_quote(&self) -> Value {
        let quote = self.create_quote().await;
        let id = quote["quote_id"].as_str().unwrap().to_string();
        for status in ["sent", "accepted"] {
            let response = self.set_status("quotes", &id, status).await;
            assert_eq!(response.status(), 200, "quote -> {}", status);
        }
        self.get(&format!("/quotes/{}", id)).await.json().await.unwrap()
    }

    /// Job converted from an accepted quote and run to completion.
    pub async fn completed_job(&self) -> Value {
        let quote = self.accepted_quote().await;
        let response = self
            .post("/jobs/from-quote", json!({ "quote_id": quote["quote_id"] }))
            .await;
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        let id = body["job"]["job_id"].as_str().unwrap().to_string();
        for status in ["in_progress", "completed"] {
            let response = self.set_status("jobs", &id, status).await;
            assert_eq!(response.status(), 200, "job -> {}", status);
        }
        self.get(&format!("/jobs/{}", id)).await.json().await.unwrap()
    }

    /// Invoice raised from a completed job and sent, for 1100.00.
    pub async fn sent_invoice(&self) -> Value {
        let job = self.completed_job().await;
        let response = self
            .post("/invoices/from-job", json!({ "job_id": job["job_id"] }))
            .await;
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        let id = body["invoice"]["invoice_id"].as_str().unwrap().to_string();
        assert_eq!(self.set_status("invoices", &id, "sent").await.status(), 200);
        self.get(&format!("/invoices/{}", id)).await.json().await.unwrap()
    }
}
