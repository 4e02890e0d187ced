//! Webhook ingestion, deduplication and retry.
//!
//! Deliveries are keyed by (source, provider event id). A processed event is
//! never run again. A failed event, or one stuck in `received` past the stale
//! window, can be claimed by a new attempt through a compare-and-set on its
//! status and attempt count, so two concurrent attempts never both run.

pub mod envelope;
pub mod handlers;

pub use envelope::{digest_key, Envelope, UNKNOWN_EVENT_TYPE};
pub use handlers::{HandlerRegistry, PaymentFailedHandler, PaymentSucceededHandler, WebhookHandler};

use super::metrics::WEBHOOK_EVENTS_TOTAL;
use super::store::Store;
use crate::models::{ListWebhookEventsFilter, WebhookEvent, WebhookEventStatus};
use chrono::Utc;
use futures::FutureExt;
use service_core::error::AppError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

fn count(source: &str, outcome: &str) {
    WEBHOOK_EVENTS_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
}

fn unavailable(e: AppError) -> AppError {
    tracing::error!(error = %e, "Failed to persist webhook event");
    AppError::ServiceUnavailable(format!("Webhook event could not be recorded: {}", e))
}

#[derive(Clone)]
pub struct WebhookEventProcessor {
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    stale_after: chrono::Duration,
}

impl WebhookEventProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            store,
            registry,
            stale_after,
        }
    }

    /// Record a delivery and run its handler unless it was already handled.
    ///
    /// Handler failures are captured on the returned event, never returned as errors.
    #[instrument(skip(self, raw_payload), fields(payload_len = raw_payload.len()))]
    pub async fn ingest(&self, source: &str, raw_payload: &str) -> Result<WebhookEvent, AppError> {
        let now = Utc::now();
        let (key, event_type, org_id, rejection) = match Envelope::parse(raw_payload) {
            Ok(envelope) => {
                let event_type = envelope.event_type_or_unknown();
                match envelope.event_id.clone() {
                    Some(id) => (id, event_type, envelope.org_id, None),
                    None => (
                        digest_key(raw_payload),
                        event_type,
                        envelope.org_id,
                        Some("Payload has no event identifier".to_string()),
                    ),
                }
            }
            Err(e) => (
                digest_key(raw_payload),
                UNKNOWN_EVENT_TYPE.to_string(),
                None,
                Some(format!("Invalid JSON payload: {}", e)),
            ),
        };

        if let Some(existing) = self.store.find_webhook_event(source, &key).await? {
            return self.redelivered(existing).await;
        }

        let mut event = WebhookEvent {
            webhook_event_id: Uuid::new_v4(),
            source: source.to_string(),
            external_event_id: key,
            event_type,
            org_id,
            status: WebhookEventStatus::Received,
            payload: raw_payload.to_string(),
            error_message: None,
            attempts: 1,
            received_utc: now,
            last_attempt_utc: Some(now),
            processed_utc: None,
        };
        if let Some(reason) = &rejection {
            event.status = WebhookEventStatus::Failed;
            event.error_message = Some(reason.clone());
        }

        match self.store.insert_webhook_event(&event).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                // Lost the race to a concurrent delivery of the same event.
                count(source, "duplicate");
                return self
                    .store
                    .find_webhook_event(source, &event.external_event_id)
                    .await?
                    .ok_or(e);
            }
            Err(e) => return Err(unavailable(e)),
        }

        if let Some(reason) = rejection {
            count(source, "failed");
            tracing::warn!(
                webhook_event_id = %event.webhook_event_id,
                source = %source,
                reason = %reason,
                "Webhook payload rejected"
            );
            return Ok(event);
        }

        tracing::info!(
            webhook_event_id = %event.webhook_event_id,
            external_event_id = %event.external_event_id,
            event_type = %event.event_type,
            "Webhook event received"
        );
        self.attempt(event).await
    }

    async fn redelivered(&self, existing: WebhookEvent) -> Result<WebhookEvent, AppError> {
        let now = Utc::now();
        if existing.status == WebhookEventStatus::Processed {
            count(&existing.source, "duplicate");
            tracing::info!(
                webhook_event_id = %existing.webhook_event_id,
                external_event_id = %existing.external_event_id,
                "Duplicate webhook delivery ignored"
            );
            return Ok(existing);
        }
        if !existing.is_claimable(now, self.stale_after) {
            count(&existing.source, "in_flight");
            return Ok(existing);
        }

        match self
            .store
            .claim_webhook_event(
                existing.webhook_event_id,
                existing.status,
                existing.attempts,
                now,
            )
            .await?
        {
            Some(claimed) => self.attempt(claimed).await,
            None => {
                count(&existing.source, "in_flight");
                Ok(existing)
            }
        }
    }

    /// Re-run a stored event with its original payload.
    #[instrument(skip(self))]
    pub async fn retry(&self, webhook_event_id: Uuid) -> Result<WebhookEvent, AppError> {
        let event = self
            .store
            .get_webhook_event(webhook_event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Webhook event not found")))?;

        if event.status == WebhookEventStatus::Processed {
            return Ok(event);
        }

        let now = Utc::now();
        if !event.is_claimable(now, self.stale_after) {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Webhook event is still being processed"
            )));
        }

        let claimed = self
            .store
            .claim_webhook_event(webhook_event_id, event.status, event.attempts, now)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState(anyhow::anyhow!(
                    "Webhook event was claimed by another attempt"
                ))
            })?;

        tracing::info!(
            webhook_event_id = %webhook_event_id,
            attempt = claimed.attempts,
            "Retrying webhook event"
        );
        self.attempt(claimed).await
    }

    /// Dispatch a claimed event and persist the outcome.
    async fn attempt(&self, mut event: WebhookEvent) -> Result<WebhookEvent, AppError> {
        let outcome = match Envelope::parse(&event.payload) {
            Ok(envelope) => {
                event.org_id = envelope.org_id.or(event.org_id);
                match self.registry.get(&event.event_type) {
                    Some(handler) => AssertUnwindSafe(handler.handle(&event, &envelope))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(AppError::InternalError(anyhow::anyhow!("Webhook handler panicked")))
                        }),
                    None => {
                        tracing::debug!(
                            event_type = %event.event_type,
                            "No handler for webhook event type; acknowledging"
                        );
                        Ok(())
                    }
                }
            }
            Err(e) => Err(AppError::BadRequest(anyhow::anyhow!(
                "Invalid JSON payload: {}",
                e
            ))),
        };

        match outcome {
            Ok(()) => {
                event.status = WebhookEventStatus::Processed;
                event.error_message = None;
                event.processed_utc = Some(Utc::now());
                count(&event.source, "processed");
            }
            Err(e) => {
                tracing::warn!(
                    webhook_event_id = %event.webhook_event_id,
                    event_type = %event.event_type,
                    attempt = event.attempts,
                    error = %e,
                    "Webhook handler failed"
                );
                event.status = WebhookEventStatus::Failed;
                event.error_message = Some(e.to_string());
                count(&event.source, "failed");
            }
        }

        self.store
            .finish_webhook_event(&event)
            .await
            .map_err(unavailable)?;
        Ok(event)
    }

    pub async fn get(&self, webhook_event_id: Uuid) -> Result<WebhookEvent, AppError> {
        self.store
            .get_webhook_event(webhook_event_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Webhook event not found")))
    }

    pub async fn list(&self, filter: &ListWebhookEventsFilter) -> Result<Vec<WebhookEvent>, AppError> {
        self.store.list_webhook_events(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fails until `healthy` is set, counting every call.
    #[derive(Default)]
    struct FlakyHandler {
        calls: AtomicUsize,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl WebhookHandler for FlakyHandler {
        async fn handle(&self, _event: &WebhookEvent, _envelope: &Envelope) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(AppError::ServiceUnavailable("ledger offline".to_string()))
            }
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl WebhookHandler for PanickingHandler {
        async fn handle(&self, _event: &WebhookEvent, _envelope: &Envelope) -> Result<(), AppError> {
            panic!("arithmetic overflow")
        }
    }

    fn processor(handler: Arc<FlakyHandler>) -> (WebhookEventProcessor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(&["test.event"], handler);
        let processor = WebhookEventProcessor::new(
            store.clone(),
            Arc::new(registry),
            chrono::Duration::seconds(300),
        );
        (processor, store)
    }

    const PAYLOAD: &str = r#"{"id":"evt_123","type":"test.event","data":{}}"#;

    #[tokio::test]
    async fn failed_event_succeeds_on_retry() {
        let handler = Arc::new(FlakyHandler::default());
        let (processor, _) = processor(handler.clone());

        let failed = processor.ingest("acme", PAYLOAD).await.unwrap();
        assert_eq!(failed.status, WebhookEventStatus::Failed);
        assert!(failed.error_message.as_deref().unwrap().contains("ledger offline"));

        handler.healthy.store(true, Ordering::SeqCst);
        let retried = processor.retry(failed.webhook_event_id).await.unwrap();

        assert_eq!(retried.status, WebhookEventStatus::Processed);
        assert_eq!(retried.attempts, 2);
        assert!(retried.error_message.is_none());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn processed_event_runs_handler_once() {
        let handler = Arc::new(FlakyHandler::default());
        handler.healthy.store(true, Ordering::SeqCst);
        let (processor, _) = processor(handler.clone());

        let first = processor.ingest("acme", PAYLOAD).await.unwrap();
        let second = processor.ingest("acme", PAYLOAD).await.unwrap();
        let retried = processor.retry(first.webhook_event_id).await.unwrap();

        assert_eq!(first.webhook_event_id, second.webhook_event_id);
        assert_eq!(second.status, WebhookEventStatus::Processed);
        assert_eq!(retried, second);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_event() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(&["test.event"], Arc::new(PanickingHandler));
        let processor = WebhookEventProcessor::new(
            store.clone(),
            Arc::new(registry),
            chrono::Duration::seconds(300),
        );

        let event = processor.ingest("acme", PAYLOAD).await.unwrap();

        assert_eq!(event.status, WebhookEventStatus::Failed);
        assert!(event.error_message.as_deref().unwrap().contains("panicked"));
        let stored = store.get_webhook_event(event.webhook_event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WebhookEventStatus::Failed);
    }

    #[tokio::test]
    async fn same_id_from_another_source_is_a_new_event() {
        let handler = Arc::new(FlakyHandler::default());
        handler.healthy.store(true, Ordering::SeqCst);
        let (processor, _) = processor(handler.clone());

        let a = processor.ingest("acme", PAYLOAD).await.unwrap();
        let b = processor.ingest("globex", PAYLOAD).await.unwrap();

        assert_ne!(a.webhook_event_id, b.webhook_event_id);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn redelivery_of_failed_event_is_retried() {
        let handler = Arc::new(FlakyHandler::default());
        let (processor, _) = processor(handler.clone());

        processor.ingest("acme", PAYLOAD).await.unwrap();
        handler.healthy.store(true, Ordering::SeqCst);
        let redelivered = processor.ingest("acme", PAYLOAD).await.unwrap();

        assert_eq!(redelivered.status, WebhookEventStatus::Processed);
        assert_eq!(redelivered.attempts, 2);
    }

    #[tokio::test]
    async fn unparseable_payload_is_keyed_by_digest_and_failed() {
        let handler = Arc::new(FlakyHandler::default());
        let (processor, _) = processor(handler.clone());

        let event = processor.ingest("acme", "not json").await.unwrap();
        let again = processor.ingest("acme", "not json").await.unwrap();

        assert_eq!(event.status, WebhookEventStatus::Failed);
        assert!(event.external_event_id.starts_with("sha256:"));
        assert_eq!(event.webhook_event_id, again.webhook_event_id);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_event_types_are_acknowledged() {
        let handler = Arc::new(FlakyHandler::default());
        let (processor, _) = processor(handler.clone());

        let event = processor
            .ingest("acme", r#"{"id":"evt_9","type":"customer.updated"}"#)
            .await
            .unwrap();

        assert_eq!(event.status, WebhookEventStatus::Processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn in_flight_event_cannot_be_retried() {
        let handler = Arc::new(FlakyHandler::default());
        let (processor, store) = processor(handler);
        let now = Utc::now();
        let event = WebhookEvent {
            webhook_event_id: Uuid::new_v4(),
            source: "acme".to_string(),
            external_event_id: "evt_busy".to_string(),
            event_type: "test.event".to_string(),
            org_id: None,
            status: WebhookEventStatus::Received,
            payload: PAYLOAD.to_string(),
            error_message: None,
            attempts: 1,
            received_utc: now,
            last_attempt_utc: Some(now),
            processed_utc: None,
        };
        store.insert_webhook_event(&event).await.unwrap();

        let result = processor.retry(event.webhook_event_id).await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
    }
}
