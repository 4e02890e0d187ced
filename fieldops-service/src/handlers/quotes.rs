//! Quote handlers.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use super::{add_note, LineItemChangesRequest, StatusChangeRequest};
use crate::middleware::OrgContext;
use crate::models::{ActivityLogEntry, CreateNote, CreateQuote, EntityRef, QuoteDetail};
use crate::startup::AppState;
use crate::utils::{JsonBody, ValidatedJson};
use service_core::error::AppError;

/// POST /quotes
pub async fn create_quote(
    State(state): State<AppState>,
    ctx: OrgContext,
    ValidatedJson(req): ValidatedJson<CreateQuote>,
) -> Result<(StatusCode, Json<QuoteDetail>), AppError> {
    let detail = state
        .documents
        .create_quote(ctx.org_id, req, ctx.actor_id)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

/// GET /quotes/:quote_id
pub async fn get_quote(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(quote_id): Path<Uuid>,
) -> Result<Json<QuoteDetail>, AppError> {
    Ok(Json(state.documents.get_quote(ctx.org_id, quote_id).await?))
}

/// DELETE /quotes/:quote_id
pub async fn delete_quote(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(quote_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.documents.delete_quote(ctx.org_id, quote_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /quotes/:quote_id/status
pub async fn change_status(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(quote_id): Path<Uuid>,
    JsonBody(req): JsonBody<StatusChangeRequest>,
) -> Result<Json<QuoteDetail>, AppError> {
    let detail = state
        .lifecycle
        .change_quote_status(ctx.org_id, quote_id, req.target()?, ctx.actor_id)
        .await?;
    Ok(Json(detail))
}

/// PUT /quotes/:quote_id/line-items
pub async fn edit_line_items(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(quote_id): Path<Uuid>,
    JsonBody(req): JsonBody<LineItemChangesRequest>,
) -> Result<Json<QuoteDetail>, AppError> {
    let detail = state
        .line_items
        .edit_quote_items(ctx.org_id, quote_id, &req.changes, ctx.actor_id)
        .await?;
    Ok(Json(detail))
}

/// GET /quotes/:quote_id/activity
pub async fn list_activity(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(quote_id): Path<Uuid>,
) -> Result<Json<Vec<ActivityLogEntry>>, AppError> {
    state.documents.get_quote(ctx.org_id, quote_id).await?;
    let history = state
        .recorder
        .history(ctx.org_id, EntityRef::quote(quote_id))
        .await?;
    Ok(Json(history))
}

/// POST /quotes/:quote_id/activity
pub async fn add_activity_note(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(quote_id): Path<Uuid>,
    JsonBody(req): JsonBody<CreateNote>,
) -> Result<(StatusCode, Json<ActivityLogEntry>), AppError> {
    state.documents.get_quote(ctx.org_id, quote_id).await?;
    let entry = add_note(&state, ctx.org_id, EntityRef::quote(quote_id), req, ctx.actor_id).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
