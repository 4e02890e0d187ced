//! Invoice handlers. Responses carry the derived `overdue` status.

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{add_note, LineItemChangesRequest, StatusChangeRequest};
use crate::middleware::OrgContext;
use crate::models::{ActivityLogEntry, CreateInvoice, CreateNote, EntityRef, InvoiceDetail};
use crate::services::Conversion;
use crate::startup::AppState;
use crate::utils::{JsonBody, ValidatedJson};
use service_core::error::AppError;

#[derive(Debug, Deserialize)]
pub struct FromJobRequest {
    pub job_id: Uuid,
}

fn present(detail: InvoiceDetail) -> InvoiceDetail {
    InvoiceDetail {
        invoice: detail.invoice.with_effective_status(Utc::now().date_naive()),
        line_items: detail.line_items,
    }
}

/// POST /invoices
pub async fn create_invoice(
    State(state): State<AppState>,
    ctx: OrgContext,
    ValidatedJson(req): ValidatedJson<CreateInvoice>,
) -> Result<(StatusCode, Json<InvoiceDetail>), AppError> {
    let detail = state
        .documents
        .create_invoice(ctx.org_id, req, ctx.actor_id)
        .await?;
    Ok((StatusCode::CREATED, Json(present(detail))))
}

/// POST /invoices/from-job
///
/// 201 with the new invoice, or 409 naming the invoice the job already produced.
pub async fn create_from_job(
    State(state): State<AppState>,
    ctx: OrgContext,
    JsonBody(req): JsonBody<FromJobRequest>,
) -> Result<Response, AppError> {
    let conversion = state
        .conversions
        .convert_job_to_invoice(ctx.org_id, req.job_id, ctx.actor_id)
        .await?;

    Ok(match conversion {
        Conversion::Created(detail) => (
            StatusCode::CREATED,
            Json(json!({ "invoice": present(detail) })),
        )
            .into_response(),
        Conversion::Existing(invoice_id) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "Job has already been invoiced",
                "existing_invoice_id": invoice_id,
            })),
        )
            .into_response(),
    })
}

/// GET /invoices/:invoice_id
pub async fn get_invoice(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDetail>, AppError> {
    Ok(Json(state.documents.get_invoice(ctx.org_id, invoice_id).await?))
}

/// DELETE /invoices/:invoice_id
pub async fn delete_invoice(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.documents.delete_invoice(ctx.org_id, invoice_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /invoices/:invoice_id/status
pub async fn change_status(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(invoice_id): Path<Uuid>,
    JsonBody(req): JsonBody<StatusChangeRequest>,
) -> Result<Json<InvoiceDetail>, AppError> {
    let detail = state
        .lifecycle
        .change_invoice_status(ctx.org_id, invoice_id, req.target()?, ctx.actor_id)
        .await?;
    Ok(Json(present(detail)))
}

/// PUT /invoices/:invoice_id/line-items
pub async fn edit_line_items(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(invoice_id): Path<Uuid>,
    JsonBody(req): JsonBody<LineItemChangesRequest>,
) -> Result<Json<InvoiceDetail>, AppError> {
    let detail = state
        .line_items
        .edit_invoice_items(ctx.org_id, invoice_id, &req.changes, ctx.actor_id)
        .await?;
    Ok(Json(present(detail)))
}

/// GET /invoices/:invoice_id/activity
pub async fn list_activity(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Vec<ActivityLogEntry>>, AppError> {
    state.documents.get_invoice(ctx.org_id, invoice_id).await?;
    let history = state
        .recorder
        .history(ctx.org_id, EntityRef::invoice(invoice_id))
        .await?;
    Ok(Json(history))
}

/// POST /invoices/:invoice_id/activity
pub async fn add_activity_note(
    State(state): State<AppState>,
    ctx: OrgContext,
    Path(invoice_id): Path<Uuid>,
    JsonBody(req): JsonBody<CreateNote>,
) -> Result<(StatusCode, Json<ActivityLogEntry>), AppError> {
    state.documents.get_invoice(ctx.org_id, invoice_id).await?;
    let entry = add_note(
        &state,
        ctx.org_id,
        EntityRef::invoice(invoice_id),
        req,
        ctx.actor_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
