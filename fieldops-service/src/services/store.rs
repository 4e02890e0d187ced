//! Storage seam for fieldops-service.
//!
//! Every document lookup is scoped to an organization. Document writes are
//! compare-and-set on what the writer read (status, and for quotes and
//! invoices the `updated_utc` stamp) and return `false` when another writer got
//! there first. Uniqueness violations surface as [`AppError::Conflict`].

use crate::models::{
    ActivityLogEntry, EntityKind, EntityRef, Invoice, InvoiceDetail, InvoiceStatus, Job,
    JobStatus, LineItem, ListWebhookEventsFilter, Payment, Quote, QuoteDetail, QuoteStatus,
    WebhookEvent, WebhookEventStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Row state a quote or invoice write was planned against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected<S> {
    pub status: S,
    pub updated_utc: DateTime<Utc>,
}

impl Expected<QuoteStatus> {
    pub fn quote(quote: &Quote) -> Self {
        Self {
            status: quote.status,
            updated_utc: quote.updated_utc,
        }
    }
}

impl Expected<InvoiceStatus> {
    pub fn invoice(invoice: &Invoice) -> Self {
        Self {
            status: invoice.status,
            updated_utc: invoice.updated_utc,
        }
    }
}

/// Job write performed together with an invoice insert.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job: Job,
    pub expected_status: JobStatus,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness of the backing storage.
    async fn ping(&self) -> Result<(), AppError>;

    /// Next per-organization sequence value for document numbers.
    async fn next_sequence(&self, org_id: Uuid, kind: EntityKind) -> Result<i64, AppError>;

    // ==================== Quotes ====================

    async fn insert_quote(
        &self,
        detail: &QuoteDetail,
        entries: &[ActivityLogEntry],
    ) -> Result<(), AppError>;

    async fn get_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<Option<QuoteDetail>, AppError>;

    /// Write the quote row and, when given, replace its full line item set.
    async fn update_quote(
        &self,
        quote: &Quote,
        expected: Expected<QuoteStatus>,
        line_items: Option<&[LineItem]>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError>;

    /// Delete a draft quote with its line items and activity.
    async fn delete_draft_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<bool, AppError>;

    // ==================== Jobs ====================

    async fn insert_job(&self, job: &Job, entries: &[ActivityLogEntry]) -> Result<(), AppError>;

    async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<Job>, AppError>;

    async fn find_job_by_quote(&self, org_id: Uuid, quote_id: Uuid)
        -> Result<Option<Job>, AppError>;

    async fn update_job(
        &self,
        job: &Job,
        expected_status: JobStatus,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError>;

    // ==================== Invoices ====================

    /// Insert an invoice, optionally moving its source job in the same write.
    ///
    /// A stale job status aborts the whole write with [`AppError::InvalidState`].
    async fn insert_invoice(
        &self,
        detail: &InvoiceDetail,
        job_update: Option<&JobUpdate>,
        entries: &[ActivityLogEntry],
    ) -> Result<(), AppError>;

    async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceDetail>, AppError>;

    async fn find_invoice_by_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Invoice>, AppError>;

    async fn update_invoice(
        &self,
        invoice: &Invoice,
        expected: Expected<InvoiceStatus>,
        line_items: Option<&[LineItem]>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError>;

    async fn delete_draft_invoice(&self, org_id: Uuid, invoice_id: Uuid)
        -> Result<bool, AppError>;

    // ==================== Payments ====================

    async fn find_payment(
        &self,
        org_id: Uuid,
        provider: &str,
        provider_reference: &str,
    ) -> Result<Option<Payment>, AppError>;

    /// Record a payment and write the invoice it settles in one transaction.
    async fn record_payment(
        &self,
        payment: &Payment,
        invoice: &Invoice,
        expected: Expected<InvoiceStatus>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError>;

    // ==================== Activity ====================

    async fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), AppError>;

    /// Entries for one document, oldest first.
    async fn list_activity(
        &self,
        org_id: Uuid,
        entity: EntityRef,
    ) -> Result<Vec<ActivityLogEntry>, AppError>;

    // ==================== Webhook events ====================

    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), AppError>;

    async fn get_webhook_event(&self, webhook_event_id: Uuid)
        -> Result<Option<WebhookEvent>, AppError>;

    async fn find_webhook_event(
        &self,
        source: &str,
        external_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError>;

    /// Move an event back to `received` for a new attempt.
    ///
    /// Succeeds only if status and attempt count still match what the caller read.
    async fn claim_webhook_event(
        &self,
        webhook_event_id: Uuid,
        expected_status: WebhookEventStatus,
        expected_attempts: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, AppError>;

    /// Persist the outcome of an attempt.
    async fn finish_webhook_event(&self, event: &WebhookEvent) -> Result<(), AppError>;

    async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError>;
}
