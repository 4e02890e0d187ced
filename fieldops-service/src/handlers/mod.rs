//! HTTP handlers for fieldops-service.

pub mod invoices;
pub mod jobs;
pub mod quotes;
pub mod webhooks;

use crate::models::{ActivityLogEntry, CreateNote, EntityRef};
use crate::startup::AppState;
use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::error::AppError;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Shared request bodies
// ============================================================================

/// Body of `PATCH /{quotes,jobs,invoices}/:id/status`.
#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: String,
    /// Final cost recorded when a job is completed.
    #[serde(default)]
    pub actual_total: Option<Decimal>,
}

impl StatusChangeRequest {
    pub fn target<S>(&self) -> Result<S, AppError>
    where
        S: FromStr<Err = anyhow::Error>,
    {
        S::from_str(self.status.trim()).map_err(AppError::BadRequest)
    }
}

/// Body of `PUT /{quotes,invoices}/:id/line-items`.
#[derive(Debug, Deserialize)]
pub struct LineItemChangesRequest {
    pub changes: Vec<crate::models::LineItemChange>,
}

pub(crate) async fn add_note(
    state: &AppState,
    org_id: Uuid,
    entity: EntityRef,
    note: CreateNote,
    actor_id: Option<Uuid>,
) -> Result<ActivityLogEntry, AppError> {
    let details = note.details.trim();
    if details.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("Note must not be empty")));
    }
    state
        .recorder
        .note(org_id, entity, details.to_string(), actor_id)
        .await
}
