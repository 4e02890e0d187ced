//! Persisted status changes.
//!
//! A change is validated against the document as loaded, then written with a
//! compare-and-set on the loaded status and modification time. Customer notifications go out only
//! after the write, under a timeout, and never undo the change.

use super::activity::ActivityRecorder;
use super::metrics::{NOTIFICATIONS_TOTAL, TRANSITIONS_TOTAL};
use super::notifier::Notifier;
use super::store::{Expected, Store};
use super::transitions::StatusTransitionValidator;
use crate::models::{
    EntityRef, InvoiceDetail, InvoiceStatus, Job, JobStatus, QuoteDetail, QuoteStatus,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct LifecycleService {
    store: Arc<dyn Store>,
    validator: Arc<StatusTransitionValidator>,
    notifier: Arc<dyn Notifier>,
    recorder: ActivityRecorder,
    notify_timeout: Duration,
}

fn record_outcome<T>(kind: &str, to: &str, result: &Result<T, AppError>) {
    let outcome = match result {
        Ok(_) => "applied",
        Err(AppError::InvalidState(_)) => "rejected",
        Err(_) => "invalid",
    };
    TRANSITIONS_TOTAL
        .with_label_values(&[kind, to, outcome])
        .inc();
}

/// Error for a status write that lost its compare-and-set.
fn lost_write<S>(kind: &str, loaded: S, current: Option<S>, target: S) -> AppError
where
    S: std::fmt::Display + PartialEq,
{
    match current {
        Some(current) if current == loaded => AppError::InvalidState(anyhow::anyhow!(
            "{} was modified concurrently; reload and retry",
            kind
        )),
        Some(current) => AppError::transition(current, target),
        None => AppError::transition("deleted", target),
    }
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn Store>,
        validator: Arc<StatusTransitionValidator>,
        notifier: Arc<dyn Notifier>,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            recorder: ActivityRecorder::new(store.clone()),
            store,
            validator,
            notifier,
            notify_timeout,
        }
    }

    #[instrument(skip(self))]
    pub async fn change_quote_status(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
        target: QuoteStatus,
        actor_id: Option<Uuid>,
    ) -> Result<QuoteDetail, AppError> {
        let result = self.apply_quote(org_id, quote_id, target, actor_id).await;
        record_outcome("quote", target.as_str(), &result);
        let updated = result?;

        if target == QuoteStatus::Sent {
            let quote = &updated.quote;
            self.notify(
                org_id,
                EntityRef::quote(quote.quote_id),
                actor_id,
                self.notifier.quote_sent(quote),
            )
            .await;
        }

        Ok(updated)
    }

    async fn apply_quote(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
        target: QuoteStatus,
        actor_id: Option<Uuid>,
    ) -> Result<QuoteDetail, AppError> {
        let detail = self
            .store
            .get_quote(org_id, quote_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Quote not found")))?;
        let expected = Expected::quote(&detail.quote);

        let (updated, entry) = self
            .validator
            .apply_transition(&detail, target, actor_id, Utc::now())?;

        if !self
            .store
            .update_quote(&updated.quote, expected, None, &[entry])
            .await?
        {
            let current = self
                .store
                .get_quote(org_id, quote_id)
                .await?
                .map(|d| d.quote.status);
            return Err(lost_write("Quote", expected.status, current, target));
        }

        tracing::info!(
            quote_id = %quote_id,
            from = %expected.status,
            to = %target,
            "Quote status changed"
        );
        Ok(updated)
    }

    /// Change a job's status. `actual_total` is recorded when the job completes.
    #[instrument(skip(self))]
    pub async fn change_job_status(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        target: JobStatus,
        actual_total: Option<Decimal>,
        actor_id: Option<Uuid>,
    ) -> Result<Job, AppError> {
        let result = self
            .apply_job(org_id, job_id, target, actual_total, actor_id)
            .await;
        record_outcome("job", target.as_str(), &result);
        result
    }

    async fn apply_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        target: JobStatus,
        actual_total: Option<Decimal>,
        actor_id: Option<Uuid>,
    ) -> Result<Job, AppError> {
        let job = self
            .store
            .get_job(org_id, job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Job not found")))?;
        let expected = job.status;

        let (mut updated, entry) = self
            .validator
            .apply_transition(&job, target, actor_id, Utc::now())?;

        if target == JobStatus::Completed {
            if let Some(total) = actual_total {
                if total < Decimal::ZERO {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Actual total cannot be negative"
                    )));
                }
                updated.actual_total = Some(total);
            }
        }

        if !self.store.update_job(&updated, expected, &[entry]).await? {
            let current = self
                .store
                .get_job(org_id, job_id)
                .await?
                .map(|j| j.status.to_string())
                .unwrap_or_else(|| "deleted".to_string());
            return Err(AppError::transition(current, target));
        }

        tracing::info!(
            job_id = %job_id,
            from = %expected,
            to = %target,
            "Job status changed"
        );
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn change_invoice_status(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        target: InvoiceStatus,
        actor_id: Option<Uuid>,
    ) -> Result<InvoiceDetail, AppError> {
        let result = self.apply_invoice(org_id, invoice_id, target, actor_id).await;
        record_outcome("invoice", target.as_str(), &result);
        let updated = result?;

        if target == InvoiceStatus::Sent {
            let invoice = &updated.invoice;
            self.notify(
                org_id,
                EntityRef::invoice(invoice.invoice_id),
                actor_id,
                self.notifier.invoice_sent(invoice),
            )
            .await;
        }

        Ok(updated)
    }

    async fn apply_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        target: InvoiceStatus,
        actor_id: Option<Uuid>,
    ) -> Result<InvoiceDetail, AppError> {
        let detail = self
            .store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        let expected = Expected::invoice(&detail.invoice);
        let now = Utc::now();

        let (updated, entry) = self
            .validator
            .apply_transition(&detail, target, actor_id, now)?;

        if !self
            .store
            .update_invoice(&updated.invoice, expected, None, &[entry])
            .await?
        {
            let current = self
                .store
                .get_invoice(org_id, invoice_id)
                .await?
                .map(|d| d.invoice.status);
            return Err(lost_write("Invoice", expected.status, current, target));
        }

        tracing::info!(
            invoice_id = %invoice_id,
            from = %expected.status,
            to = %target,
            "Invoice status changed"
        );
        Ok(updated)
    }

    /// Run a customer notification under the configured timeout. Failures are logged and audited.
    async fn notify<F>(&self, org_id: Uuid, entity: EntityRef, actor_id: Option<Uuid>, delivery: F)
    where
        F: Future<Output = Result<(), AppError>>,
    {
        let kind = entity.kind.as_str();
        let reason = match tokio::time::timeout(self.notify_timeout, delivery).await {
            Ok(Ok(())) => {
                NOTIFICATIONS_TOTAL.with_label_values(&[kind, "sent"]).inc();
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("Timed out after {}ms", self.notify_timeout.as_millis()),
        };

        NOTIFICATIONS_TOTAL.with_label_values(&[kind, "failed"]).inc();
        tracing::warn!(entity = %entity, reason = %reason, "Customer notification failed");

        let entry = ActivityRecorder::entry(
            org_id,
            entity,
            "Customer notification failed",
            Some(reason.clone()),
            json!({ "reason": reason }),
            actor_id,
            Utc::now(),
        );
        if let Err(e) = self.recorder.record(entry).await {
            tracing::error!(entity = %entity, error = %e, "Failed to audit notification failure");
        }
    }
}
