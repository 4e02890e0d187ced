//! Activity (audit) log entries.

use super::store::Store;
use crate::models::{ActivityLogEntry, EntityRef};
use chrono::{DateTime, Utc};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Builds and appends activity entries, and reads a document's history.
#[derive(Clone)]
pub struct ActivityRecorder {
    store: Arc<dyn Store>,
}

impl ActivityRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn entry(
        org_id: Uuid,
        entity: EntityRef,
        action: impl Into<String>,
        details: Option<String>,
        metadata: serde_json::Value,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> ActivityLogEntry {
        ActivityLogEntry {
            activity_id: Uuid::new_v4(),
            org_id,
            entity,
            action: action.into(),
            details,
            metadata,
            actor_id,
            created_utc: at,
        }
    }

    pub fn created(
        org_id: Uuid,
        entity: EntityRef,
        number: &str,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> ActivityLogEntry {
        Self::entry(
            org_id,
            entity,
            format!("{} {} created", capitalize(entity.kind.as_str()), number),
            None,
            json!({ "number": number }),
            actor_id,
            at,
        )
    }

    pub fn status_change(
        org_id: Uuid,
        entity: EntityRef,
        from: &str,
        to: &str,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> ActivityLogEntry {
        Self::entry(
            org_id,
            entity,
            format!("Status changed from {} to {}", from, to),
            None,
            json!({ "from": from, "to": to }),
            actor_id,
            at,
        )
    }

    /// Entry on a document created from `source`.
    pub fn origin(
        org_id: Uuid,
        entity: EntityRef,
        source: EntityRef,
        source_number: &str,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> ActivityLogEntry {
        Self::entry(
            org_id,
            entity,
            format!("Created from {} {}", source.kind, source_number),
            None,
            json!({ "source_kind": source.kind, "source_id": source.id }),
            actor_id,
            at,
        )
    }

    /// Entry on a source document that produced `target`.
    pub fn converted(
        org_id: Uuid,
        entity: EntityRef,
        target: EntityRef,
        target_number: &str,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> ActivityLogEntry {
        Self::entry(
            org_id,
            entity,
            format!("Converted to {} {}", target.kind, target_number),
            None,
            json!({ "target_kind": target.kind, "target_id": target.id }),
            actor_id,
            at,
        )
    }

    pub fn line_items_changed(
        org_id: Uuid,
        entity: EntityRef,
        added: usize,
        updated: usize,
        removed: usize,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> ActivityLogEntry {
        Self::entry(
            org_id,
            entity,
            "Line items updated",
            None,
            json!({ "added": added, "updated": updated, "removed": removed }),
            actor_id,
            at,
        )
    }

    /// Append a standalone entry.
    #[instrument(skip(self, entry), fields(entity = %entry.entity))]
    pub async fn record(&self, entry: ActivityLogEntry) -> Result<ActivityLogEntry, AppError> {
        self.store.append_activity(&entry).await?;
        Ok(entry)
    }

    /// Append a free-form note.
    pub async fn note(
        &self,
        org_id: Uuid,
        entity: EntityRef,
        details: String,
        actor_id: Option<Uuid>,
    ) -> Result<ActivityLogEntry, AppError> {
        let entry = Self::entry(
            org_id,
            entity,
            "Note added",
            Some(details),
            json!({}),
            actor_id,
            Utc::now(),
        );
        self.record(entry).await
    }

    /// History of one document, oldest first.
    #[instrument(skip(self))]
    pub async fn history(
        &self,
        org_id: Uuid,
        entity: EntityRef,
    ) -> Result<Vec<ActivityLogEntry>, AppError> {
        self.store.list_activity(org_id, entity).await
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;

    #[test]
    fn status_change_carries_from_and_to() {
        let entry = ActivityRecorder::status_change(
            Uuid::new_v4(),
            EntityRef::quote(Uuid::new_v4()),
            "sent",
            "accepted",
            None,
            Utc::now(),
        );
        assert_eq!(entry.action, "Status changed from sent to accepted");
        assert_eq!(entry.metadata, json!({ "from": "sent", "to": "accepted" }));
    }

    #[test]
    fn created_entry_names_the_document() {
        let entry = ActivityRecorder::created(
            Uuid::new_v4(),
            EntityRef::invoice(Uuid::new_v4()),
            "INV-00003",
            None,
            Utc::now(),
        );
        assert_eq!(entry.action, "Invoice INV-00003 created");
    }

    #[tokio::test]
    async fn history_is_oldest_first_and_scoped() {
        let recorder = ActivityRecorder::new(Arc::new(MemoryStore::new()));
        let org_id = Uuid::new_v4();
        let job = EntityRef::job(Uuid::new_v4());
        let earlier = Utc::now() - chrono::Duration::minutes(5);

        recorder
            .record(ActivityRecorder::status_change(
                org_id,
                job,
                "scheduled",
                "in_progress",
                None,
                Utc::now(),
            ))
            .await
            .unwrap();
        recorder
            .record(ActivityRecorder::created(org_id, job, "J-00001", None, earlier))
            .await
            .unwrap();
        recorder
            .note(Uuid::new_v4(), job, "other org".to_string(), None)
            .await
            .unwrap();

        let history = recorder.history(org_id, job).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, "Job J-00001 created");
        assert_eq!(history[1].metadata["to"], "in_progress");
    }
}
