//! Job handlers, including conversion from an accepted quote.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{add_note, StatusChangeRequest};
use crate::middleware::OrgContext;
use crate::models::{ActivityLogEntry, CreateJob, CreateNote, EntityRef, Job};
use crate::services::Conversion;
use crate::startup::AppState;
use crate::utils::{JsonBody, ValidatedJson};
use service_core::error::AppError;

#[derive(Debug, Deserialize)]
pub struct FromQuoteRequest {
    pub quote_id: Uuid,
}

/// POST /jobs
pub async fn create_job(
    State(state): State<AppState>,
    ctx: OrgContext,
    ValidatedJson(req): ValidatedJson<CreateJob>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let job = state.documents.create_job(ctx.org_id, req, ctx.actor_id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// POST /jobs/from-quote
///
/// 201 with the new job, or 409 naming the job the quote already produced.
pub async fn create_from_quote(
    State(state): State<AppState>,
    ctx: OrgContext,
    JsonBody(req): JsonBody<FromQuoteRequest>,
) -> Result<Response, AppError> {
    let conversion = state
        .conversions
        .convert_quote_to_job(ctx.org_id, req.quote_id, ctx.actor_id)
        .await?;

    Ok(match conversion {
        Conversion::Created(job) => (StatusCode::CREATED, Json(json!({ "job": job }))).into_response(),
        Conversion::Existing(job_id) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Quote has already been converted to a job",
                "existing_job_id": job_id,
            })),
        )
            .into_response(),
    })
}

/// GET /jobs/:job_id
pub async fn get_job(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.documents.get_job(ctx.org_id, job_id).await?))
}

/// PATCH /jobs/:job_id/status
pub async fn change_status(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(job_id): Path<Uuid>,
    JsonBody(req): JsonBody<StatusChangeRequest>,
) -> Result<Json<Job>, AppError> {
    let job = state
        .lifecycle
        .change_job_status(
            ctx.org_id,
            job_id,
            req.target()?,
            req.actual_total,
            ctx.actor_id,
        )
        .await?;
    Ok(Json(job))
}

/// GET /jobs/:job_id/activity
pub async fn list_activity(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Vec<ActivityLogEntry>>, AppError> {
    state.documents.get_job(ctx.org_id, job_id).await?;
    let history = state
        .recorder
        .history(ctx.org_id, EntityRef::job(job_id))
        .await?;
    Ok(Json(history))
}

/// POST /jobs/:job_id/activity
pub async fn add_activity_note(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(job_id): Path<Uuid>,
    JsonBody(req): JsonBody<CreateNote>,
) -> Result<(StatusCode, Json<ActivityLogEntry>), AppError> {
    state.documents.get_job(ctx.org_id, job_id).await?;
    let entry = add_note(&state, ctx.org_id, EntityRef::job(job_id), req, ctx.actor_id).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
