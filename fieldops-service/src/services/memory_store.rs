//! In-process store used by tests and by local runs without a database.
//!
//! All state sits behind one mutex, so each trait call is atomic and the same
//! uniqueness and compare-and-set rules as the Postgres schema hold.

use super::store::{Expected, JobUpdate, Store};
use crate::models::{
    ActivityLogEntry, DocumentRef, EntityKind, EntityRef, Invoice, InvoiceDetail, InvoiceStatus,
    Job, JobStatus, LineItem, ListWebhookEventsFilter, Payment, Quote, QuoteDetail, QuoteStatus,
    WebhookEvent, WebhookEventStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    sequences: HashMap<(Uuid, EntityKind), i64>,
    quotes: HashMap<Uuid, Quote>,
    jobs: HashMap<Uuid, Job>,
    invoices: HashMap<Uuid, Invoice>,
    line_items: HashMap<DocumentRef, Vec<LineItem>>,
    activity: Vec<ActivityLogEntry>,
    webhook_events: HashMap<Uuid, WebhookEvent>,
    payments: Vec<Payment>,
}

impl State {
    fn items(&self, document: DocumentRef) -> Vec<LineItem> {
        let mut items = self.line_items.get(&document).cloned().unwrap_or_default();
        items.sort_by_key(|item| item.position);
        items
    }

    fn forget_document(&mut self, document: DocumentRef) {
        self.line_items.remove(&document);
        let entity = document.entity();
        self.activity.retain(|entry| entry.entity != entity);
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(what: &str) -> AppError {
    AppError::Conflict(anyhow::anyhow!("{} already exists", what))
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn next_sequence(&self, org_id: Uuid, kind: EntityKind) -> Result<i64, AppError> {
        let mut state = self.state.lock().await;
        let counter = state.sequences.entry((org_id, kind)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert_quote(
        &self,
        detail: &QuoteDetail,
        entries: &[ActivityLogEntry],
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let quote = &detail.quote;
        if state.quotes.contains_key(&quote.quote_id) {
            return Err(conflict("Quote"));
        }
        state.quotes.insert(quote.quote_id, quote.clone());
        state
            .line_items
            .insert(DocumentRef::Quote(quote.quote_id), detail.line_items.clone());
        state.activity.extend_from_slice(entries);
        Ok(())
    }

    async fn get_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<Option<QuoteDetail>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .quotes
            .get(&quote_id)
            .filter(|quote| quote.org_id == org_id)
            .map(|quote| QuoteDetail {
                quote: quote.clone(),
                line_items: state.items(DocumentRef::Quote(quote_id)),
            }))
    }

    async fn update_quote(
        &self,
        quote: &Quote,
        expected: Expected<QuoteStatus>,
        line_items: Option<&[LineItem]>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.quotes.get(&quote.quote_id) {
            Some(stored) if stored.org_id == quote.org_id && Expected::quote(stored) == expected => {}
            _ => return Ok(false),
        }
        state.quotes.insert(quote.quote_id, quote.clone());
        if let Some(items) = line_items {
            state
                .line_items
                .insert(DocumentRef::Quote(quote.quote_id), items.to_vec());
        }
        state.activity.extend_from_slice(entries);
        Ok(true)
    }

    async fn delete_draft_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.quotes.get(&quote_id) {
            Some(quote) if quote.org_id == org_id && quote.status == QuoteStatus::Draft => {}
            _ => return Ok(false),
        }
        state.quotes.remove(&quote_id);
        state.forget_document(DocumentRef::Quote(quote_id));
        Ok(true)
    }

    async fn insert_job(&self, job: &Job, entries: &[ActivityLogEntry]) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.job_id) {
            return Err(conflict("Job"));
        }
        if let Some(quote_id) = job.quote_id {
            if state.jobs.values().any(|j| j.quote_id == Some(quote_id)) {
                return Err(conflict("Job for this quote"));
            }
        }
        state.jobs.insert(job.job_id, job.clone());
        state.activity.extend_from_slice(entries);
        Ok(())
    }

    async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .get(&job_id)
            .filter(|job| job.org_id == org_id)
            .cloned())
    }

    async fn find_job_by_quote(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Option<Job>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .find(|job| job.org_id == org_id && job.quote_id == Some(quote_id))
            .cloned())
    }

    async fn update_job(
        &self,
        job: &Job,
        expected_status: JobStatus,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.jobs.get(&job.job_id) {
            Some(stored) if stored.org_id == job.org_id && stored.status == expected_status => {}
            _ => return Ok(false),
        }
        state.jobs.insert(job.job_id, job.clone());
        state.activity.extend_from_slice(entries);
        Ok(true)
    }

    async fn insert_invoice(
        &self,
        detail: &InvoiceDetail,
        job_update: Option<&JobUpdate>,
        entries: &[ActivityLogEntry],
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        let invoice = &detail.invoice;
        if state.invoices.contains_key(&invoice.invoice_id) {
            return Err(conflict("Invoice"));
        }
        if let Some(job_id) = invoice.job_id {
            if state.invoices.values().any(|i| i.job_id == Some(job_id)) {
                return Err(conflict("Invoice for this job"));
            }
        }
        if let Some(update) = job_update {
            match state.jobs.get(&update.job.job_id) {
                Some(stored) if stored.status == update.expected_status => {}
                Some(stored) => {
                    return Err(AppError::InvalidState(anyhow::anyhow!(
                        "Job is now '{}'",
                        stored.status
                    )))
                }
                None => return Err(AppError::NotFound(anyhow::anyhow!("Job not found"))),
            }
            state.jobs.insert(update.job.job_id, update.job.clone());
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        state.line_items.insert(
            DocumentRef::Invoice(invoice.invoice_id),
            detail.line_items.clone(),
        );
        state.activity.extend_from_slice(entries);
        Ok(())
    }

    async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceDetail>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .get(&invoice_id)
            .filter(|invoice| invoice.org_id == org_id)
            .map(|invoice| InvoiceDetail {
                invoice: invoice.clone(),
                line_items: state.items(DocumentRef::Invoice(invoice_id)),
            }))
    }

    async fn find_invoice_by_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .values()
            .find(|invoice| invoice.org_id == org_id && invoice.job_id == Some(job_id))
            .cloned())
    }

    async fn update_invoice(
        &self,
        invoice: &Invoice,
        expected: Expected<InvoiceStatus>,
        line_items: Option<&[LineItem]>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.invoices.get(&invoice.invoice_id) {
            Some(stored) if stored.org_id == invoice.org_id && Expected::invoice(stored) == expected => {}
            _ => return Ok(false),
        }
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        if let Some(items) = line_items {
            state
                .line_items
                .insert(DocumentRef::Invoice(invoice.invoice_id), items.to_vec());
        }
        state.activity.extend_from_slice(entries);
        Ok(true)
    }

    async fn delete_draft_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        match state.invoices.get(&invoice_id) {
            Some(invoice) if invoice.org_id == org_id && invoice.status == InvoiceStatus::Draft => {}
            _ => return Ok(false),
        }
        state.invoices.remove(&invoice_id);
        state.forget_document(DocumentRef::Invoice(invoice_id));
        Ok(true)
    }

    async fn find_payment(
        &self,
        org_id: Uuid,
        provider: &str,
        provider_reference: &str,
    ) -> Result<Option<Payment>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .iter()
            .find(|p| {
                p.org_id == org_id
                    && p.provider == provider
                    && p.provider_reference == provider_reference
            })
            .cloned())
    }

    async fn record_payment(
        &self,
        payment: &Payment,
        invoice: &Invoice,
        expected: Expected<InvoiceStatus>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let mut state = self.state.lock().await;
        if state.payments.iter().any(|p| {
            p.org_id == payment.org_id
                && p.provider == payment.provider
                && p.provider_reference == payment.provider_reference
        }) {
            return Err(conflict("Payment"));
        }
        match state.invoices.get(&invoice.invoice_id) {
            Some(stored) if stored.org_id == invoice.org_id && Expected::invoice(stored) == expected => {}
            _ => return Ok(false),
        }
        state.payments.push(payment.clone());
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        state.activity.extend_from_slice(entries);
        Ok(true)
    }

    async fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), AppError> {
        self.state.lock().await.activity.push(entry.clone());
        Ok(())
    }

    async fn list_activity(
        &self,
        org_id: Uuid,
        entity: EntityRef,
    ) -> Result<Vec<ActivityLogEntry>, AppError> {
        let state = self.state.lock().await;
        let mut entries: Vec<ActivityLogEntry> = state
            .activity
            .iter()
            .filter(|entry| entry.org_id == org_id && entry.entity == entity)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        entries.sort_by_key(|entry| entry.created_utc);
        Ok(entries)
    }

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.webhook_events.values().any(|e| {
            e.source == event.source && e.external_event_id == event.external_event_id
        }) {
            return Err(conflict("Webhook event"));
        }
        state
            .webhook_events
            .insert(event.webhook_event_id, event.clone());
        Ok(())
    }

    async fn get_webhook_event(
        &self,
        webhook_event_id: Uuid,
    ) -> Result<Option<WebhookEvent>, AppError> {
        Ok(self
            .state
            .lock()
            .await
            .webhook_events
            .get(&webhook_event_id)
            .cloned())
    }

    async fn find_webhook_event(
        &self,
        source: &str,
        external_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .webhook_events
            .values()
            .find(|e| e.source == source && e.external_event_id == external_event_id)
            .cloned())
    }

    async fn claim_webhook_event(
        &self,
        webhook_event_id: Uuid,
        expected_status: WebhookEventStatus,
        expected_attempts: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let mut state = self.state.lock().await;
        let Some(event) = state.webhook_events.get_mut(&webhook_event_id) else {
            return Ok(None);
        };
        if event.status != expected_status || event.attempts != expected_attempts {
            return Ok(None);
        }
        event.status = WebhookEventStatus::Received;
        event.attempts += 1;
        event.last_attempt_utc = Some(at);
        Ok(Some(event.clone()))
    }

    async fn finish_webhook_event(&self, event: &WebhookEvent) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        match state.webhook_events.get_mut(&event.webhook_event_id) {
            Some(stored) => {
                stored.status = event.status;
                stored.event_type = event.event_type.clone();
                stored.org_id = event.org_id;
                stored.error_message = event.error_message.clone();
                stored.processed_utc = event.processed_utc;
                Ok(())
            }
            None => Err(AppError::NotFound(anyhow::anyhow!("Webhook event not found"))),
        }
    }

    async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let state = self.state.lock().await;
        let mut events: Vec<WebhookEvent> = state
            .webhook_events
            .values()
            .filter(|e| filter.status.map_or(true, |s| s == e.status))
            .filter(|e| filter.source.as_deref().map_or(true, |s| s == e.source))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.received_utc.cmp(&a.received_utc));
        events.truncate(filter.limit.max(0) as usize);
        Ok(events)
    }
}
