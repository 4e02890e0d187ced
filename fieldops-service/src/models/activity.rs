//! Activity log model for fieldops-service.

use super::EntityRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit entry attached to a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub activity_id: Uuid,
    pub org_id: Uuid,
    pub entity: EntityRef,
    pub action: String,
    pub details: Option<String>,
    pub metadata: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
}

/// Input for a free-form note on a document.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNote {
    pub details: String,
}
