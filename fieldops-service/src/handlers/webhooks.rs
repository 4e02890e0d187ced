//! Webhook receiver and operator endpoints.

use axum::{
    body::Bytes,
    extract::{Json, Path, Query, State},
    http::HeaderMap,
};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::models::{ListWebhookEventsFilter, WebhookAck, WebhookEvent};
use crate::startup::AppState;
use service_core::error::AppError;
use service_core::utils::signature::verify_payload_signature;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const MAX_LIST_LIMIT: i64 = 200;

fn check_signature(
    state: &AppState,
    source: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let Some(secret) = state.config.webhook_secret(source) else {
        return Ok(());
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing {} header", SIGNATURE_HEADER))
        })?;

    if !verify_payload_signature(secret.expose_secret(), body, signature)? {
        tracing::warn!(source = %source, "Webhook signature mismatch");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }
    Ok(())
}

/// POST /webhooks/:source
///
/// Acknowledges every delivery it could record, including ones whose
/// handler failed; the outcome is on the stored event.
#[tracing::instrument(skip(state, headers, body), fields(body_len = body.len()))]
pub async fn receive(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, AppError> {
    let source = source.to_lowercase();
    check_signature(&state, &source, &headers, &body)?;

    let raw = String::from_utf8_lossy(&body);
    let event = state
        .webhooks
        .ingest(&source, &raw)
        .await
        .map_err(|e| match e {
            AppError::ServiceUnavailable(_) => e,
            other => AppError::ServiceUnavailable(other.to_string()),
        })?;

    Ok(Json(WebhookAck::from(&event)))
}

/// GET /webhooks/events
pub async fn list_events(
    State(state): State<AppState>,
    Query(mut filter): Query<ListWebhookEventsFilter>,
) -> Result<Json<Vec<WebhookEvent>>, AppError> {
    filter.limit = filter.limit.clamp(1, MAX_LIST_LIMIT);
    Ok(Json(state.webhooks.list(&filter).await?))
}

/// GET /webhooks/events/:webhook_event_id
pub async fn get_event(
    State(state): State<AppState>,
    Path(webhook_event_id): Path<Uuid>,
) -> Result<Json<WebhookEvent>, AppError> {
    Ok(Json(state.webhooks.get(webhook_event_id).await?))
}

/// POST /webhooks/events/:webhook_event_id/retry
pub async fn retry_event(
    State(state): State<AppState>,
    Path(webhook_event_id): Path<Uuid>,
) -> Result<Json<WebhookEvent>, AppError> {
    Ok(Json(state.webhooks.retry(webhook_event_id).await?))
}
