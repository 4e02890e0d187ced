//! Application startup and lifecycle management.

use crate::config::FieldOpsConfig;
use crate::handlers::{invoices, jobs, quotes, webhooks};
use crate::services::{
    get_metrics, init_metrics, ActivityRecorder, ConversionCoordinator, Database, DocumentService,
    HandlerRegistry, LifecycleService, LineItemEditor, LogNotifier, MemoryStore, Notifier,
    StatusTransitionValidator, Store, WebhookEventProcessor,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FieldOpsConfig>,
    pub store: Arc<dyn Store>,
    pub documents: DocumentService,
    pub lifecycle: LifecycleService,
    pub conversions: ConversionCoordinator,
    pub line_items: LineItemEditor,
    pub recorder: ActivityRecorder,
    pub webhooks: WebhookEventProcessor,
}

impl AppState {
    pub fn new(
        config: FieldOpsConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AppError> {
        let validator = Arc::new(StatusTransitionValidator::standard().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid transition table: {}", e))
        })?);

        let documents = DocumentService::new(store.clone(), config.payment_terms_days);
        let lifecycle = LifecycleService::new(
            store.clone(),
            validator.clone(),
            notifier,
            Duration::from_millis(config.notify_timeout_ms),
        );
        let conversions =
            ConversionCoordinator::new(store.clone(), validator.clone(), documents.clone());
        let registry = Arc::new(HandlerRegistry::standard(store.clone(), validator));
        let webhooks = WebhookEventProcessor::new(
            store.clone(),
            registry,
            chrono::Duration::seconds(config.webhook_stale_after_secs),
        );

        Ok(Self {
            config: Arc::new(config),
            line_items: LineItemEditor::new(store.clone()),
            recorder: ActivityRecorder::new(store.clone()),
            store,
            documents,
            lifecycle,
            conversions,
            webhooks,
        })
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": state.config.service_name,
                    "version": state.config.service_version,
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Recorder for the `metrics` facade used by the HTTP middleware.
fn http_metrics_handle() -> Option<&'static PrometheusHandle> {
    static HANDLE: OnceCell<Option<PrometheusHandle>> = OnceCell::new();
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "HTTP metrics recorder not installed");
                None
            }
        })
        .as_ref()
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let mut body = get_metrics();
    if let Some(handle) = http_metrics_handle() {
        body.push_str(&handle.render());
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        // Quotes
        .route("/quotes", post(quotes::create_quote))
        .route(
            "/quotes/:quote_id",
            get(quotes::get_quote).delete(quotes::delete_quote),
        )
        .route("/quotes/:quote_id/status", patch(quotes::change_status))
        .route("/quotes/:quote_id/line-items", put(quotes::edit_line_items))
        .route(
            "/quotes/:quote_id/activity",
            get(quotes::list_activity).post(quotes::add_activity_note),
        )
        // Jobs
        .route("/jobs", post(jobs::create_job))
        .route("/jobs/from-quote", post(jobs::create_from_quote))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/jobs/:job_id/status", patch(jobs::change_status))
        .route(
            "/jobs/:job_id/activity",
            get(jobs::list_activity).post(jobs::add_activity_note),
        )
        // Invoices
        .route("/invoices", post(invoices::create_invoice))
        .route("/invoices/from-job", post(invoices::create_from_job))
        .route(
            "/invoices/:invoice_id",
            get(invoices::get_invoice).delete(invoices::delete_invoice),
        )
        .route("/invoices/:invoice_id/status", patch(invoices::change_status))
        .route(
            "/invoices/:invoice_id/line-items",
            put(invoices::edit_line_items),
        )
        .route(
            "/invoices/:invoice_id/activity",
            get(invoices::list_activity).post(invoices::add_activity_note),
        )
        // Webhooks
        .route("/webhooks/events", get(webhooks::list_events))
        .route("/webhooks/events/:webhook_event_id", get(webhooks::get_event))
        .route(
            "/webhooks/events/:webhook_event_id/retry",
            post(webhooks::retry_event),
        )
        .route("/webhooks/:source", post(webhooks::receive))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    ///
    /// Uses PostgreSQL when a database is configured and the in-memory store otherwise.
    pub async fn build(config: FieldOpsConfig) -> Result<Self, AppError> {
        let store: Arc<dyn Store> = match &config.database {
            Some(database) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("No database configured; using the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        Self::build_with(config, store, Arc::new(LogNotifier)).await
    }

    /// Build the application around an existing store and notifier.
    pub async fn build_with(
        config: FieldOpsConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, AppError> {
        init_metrics();
        http_metrics_handle();

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let state = AppState::new(config, store, notifier)?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "fieldops-service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let app = router(self.state.clone());

        tracing::info!(
            service = %self.state.config.service_name,
            version = %self.state.config.service_version,
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, app).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
