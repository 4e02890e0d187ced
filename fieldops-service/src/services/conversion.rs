//! Quote to job and job to invoice conversion.
//!
//! Each source document yields at most one downstream document. The existence
//! check gives the fast answer; the store's uniqueness constraint on the
//! source reference settles races, and a rejected insert is reported as the
//! existing document.

use super::activity::ActivityRecorder;
use super::documents::DocumentService;
use super::line_items::build_items;
use super::metrics::CONVERSIONS_TOTAL;
use super::store::{JobUpdate, Store};
use super::totals::compute_totals;
use super::transitions::StatusTransitionValidator;
use crate::models::{
    default_currency, Deposit, DocumentRef, EntityKind, EntityRef, Invoice, InvoiceDetail,
    InvoiceStatus, Job, JobStatus, LineItemType, NewLineItem, QuoteStatus,
};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Outcome of a conversion request.
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion<T> {
    Created(T),
    /// The source was already converted; carries the downstream document's id.
    Existing(Uuid),
}

impl<T> Conversion<T> {
    fn label(&self) -> &'static str {
        match self {
            Conversion::Created(_) => "created",
            Conversion::Existing(_) => "existing",
        }
    }
}

fn record<T>(direction: &str, result: &Result<Conversion<T>, AppError>) {
    let outcome = match result {
        Ok(conversion) => conversion.label(),
        Err(_) => "rejected",
    };
    CONVERSIONS_TOTAL
        .with_label_values(&[direction, outcome])
        .inc();
}

#[derive(Clone)]
pub struct ConversionCoordinator {
    store: Arc<dyn Store>,
    validator: Arc<StatusTransitionValidator>,
    documents: DocumentService,
}

impl ConversionCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        validator: Arc<StatusTransitionValidator>,
        documents: DocumentService,
    ) -> Self {
        Self {
            store,
            validator,
            documents,
        }
    }

    #[instrument(skip(self))]
    pub async fn convert_quote_to_job(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<Conversion<Job>, AppError> {
        let result = self.quote_to_job(org_id, quote_id, actor_id).await;
        record("quote_to_job", &result);
        result
    }

    async fn quote_to_job(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<Conversion<Job>, AppError> {
        let detail = self
            .store
            .get_quote(org_id, quote_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Quote not found")))?;
        let quote = detail.quote;

        if quote.status != QuoteStatus::Accepted {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Quote {} is {}; only accepted quotes can be converted to a job",
                quote.quote_number,
                quote.status
            )));
        }

        if let Some(existing) = self.store.find_job_by_quote(org_id, quote_id).await? {
            tracing::info!(
                quote_id = %quote_id,
                job_id = %existing.job_id,
                "Quote already converted"
            );
            return Ok(Conversion::Existing(existing.job_id));
        }

        let now = Utc::now();
        let job_number = self.documents.next_number(org_id, EntityKind::Job).await?;
        let job = Job {
            job_id: Uuid::new_v4(),
            org_id,
            job_number,
            quote_id: Some(quote_id),
            status: JobStatus::Scheduled,
            customer_id: quote.customer_id,
            customer_name: quote.customer_name.clone(),
            customer_email: quote.customer_email.clone(),
            title: quote.title.clone(),
            site_address: quote.site_address.clone(),
            quoted_total: quote.total,
            actual_total: None,
            scheduled_start: None,
            scheduled_end: None,
            notes: quote.notes.clone(),
            created_utc: now,
            updated_utc: now,
            started_utc: None,
            completed_utc: None,
            cancelled_utc: None,
            invoiced_utc: None,
        };

        let job_ref = EntityRef::job(job.job_id);
        let quote_ref = EntityRef::quote(quote_id);
        let entries = [
            ActivityRecorder::origin(org_id, job_ref, quote_ref, &quote.quote_number, actor_id, now),
            ActivityRecorder::converted(org_id, quote_ref, job_ref, &job.job_number, actor_id, now),
        ];

        match self.store.insert_job(&job, &entries).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                return self
                    .store
                    .find_job_by_quote(org_id, quote_id)
                    .await?
                    .map(|existing| Conversion::Existing(existing.job_id))
                    .ok_or(e);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            quote_id = %quote_id,
            job_id = %job.job_id,
            job_number = %job.job_number,
            "Job created from quote"
        );
        Ok(Conversion::Created(job))
    }

    #[instrument(skip(self))]
    pub async fn convert_job_to_invoice(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<Conversion<InvoiceDetail>, AppError> {
        let result = self.job_to_invoice(org_id, job_id, actor_id).await;
        record("job_to_invoice", &result);
        result
    }

    async fn job_to_invoice(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<Conversion<InvoiceDetail>, AppError> {
        let job = self
            .store
            .get_job(org_id, job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Job not found")))?;

        if !job.status.is_billable() {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Job {} is {}; only completed jobs can be invoiced",
                job.job_number,
                job.status
            )));
        }

        if let Some(existing) = self.store.find_invoice_by_job(org_id, job_id).await? {
            tracing::info!(
                job_id = %job_id,
                invoice_id = %existing.invoice_id,
                "Job already invoiced"
            );
            return Ok(Conversion::Existing(existing.invoice_id));
        }

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let document = DocumentRef::Invoice(invoice_id);

        let (source_items, tax_rate) = self.billable_items(&job).await?;
        let line_items = build_items(org_id, document, &source_items, now)?;
        let totals = compute_totals(&line_items, tax_rate, &Deposit::None)?;
        let invoice_number = self
            .documents
            .next_number(org_id, EntityKind::Invoice)
            .await?;

        let invoice = Invoice {
            invoice_id,
            org_id,
            invoice_number,
            job_id: Some(job_id),
            status: InvoiceStatus::Draft,
            customer_id: job.customer_id,
            customer_name: job.customer_name.clone(),
            customer_email: job.customer_email.clone(),
            currency: default_currency(),
            tax_rate,
            subtotal: totals.subtotal,
            tax_total: totals.tax,
            total: totals.total,
            amount_paid: Decimal::ZERO,
            amount_due: totals.total,
            issue_date: None,
            due_date: Some(self.documents.default_due_date(now.date_naive())),
            notes: None,
            created_utc: now,
            updated_utc: now,
            sent_utc: None,
            viewed_utc: None,
            paid_utc: None,
            cancelled_utc: None,
        };

        let invoice_ref = EntityRef::invoice(invoice_id);
        let job_ref = EntityRef::job(job_id);
        let mut entries = vec![
            ActivityRecorder::origin(org_id, invoice_ref, job_ref, &job.job_number, actor_id, now),
            ActivityRecorder::converted(
                org_id,
                job_ref,
                invoice_ref,
                &invoice.invoice_number,
                actor_id,
                now,
            ),
        ];

        let job_update = if job.status == JobStatus::Completed {
            let (invoiced, entry) =
                self.validator
                    .apply_transition(&job, JobStatus::Invoiced, actor_id, now)?;
            entries.push(entry);
            Some(JobUpdate {
                job: invoiced,
                expected_status: JobStatus::Completed,
            })
        } else {
            None
        };

        let detail = InvoiceDetail {
            invoice,
            line_items,
        };

        match self
            .store
            .insert_invoice(&detail, job_update.as_ref(), &entries)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                return self
                    .store
                    .find_invoice_by_job(org_id, job_id)
                    .await?
                    .map(|existing| Conversion::Existing(existing.invoice_id))
                    .ok_or(e);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            job_id = %job_id,
            invoice_id = %invoice_id,
            invoice_number = %detail.invoice.invoice_number,
            total = %detail.invoice.total,
            "Invoice created from job"
        );
        Ok(Conversion::Created(detail))
    }

    /// Items to bill for a job and the tax rate to apply.
    ///
    /// Jobs from a quote bill the quote's non-optional items at the quote's rate.
    /// Other jobs bill one service line at the job's total, untaxed.
    async fn billable_items(&self, job: &Job) -> Result<(Vec<NewLineItem>, Decimal), AppError> {
        if let Some(quote_id) = job.quote_id {
            if let Some(detail) = self.store.get_quote(job.org_id, quote_id).await? {
                let items = detail
                    .line_items
                    .iter()
                    .filter(|item| !item.is_optional)
                    .map(|item| NewLineItem {
                        item_type: item.item_type,
                        description: item.description.clone(),
                        quantity: item.quantity,
                        unit: item.unit.clone(),
                        unit_price: item.unit_price,
                        is_optional: false,
                        position: None,
                    })
                    .collect();
                return Ok((items, detail.quote.tax_rate));
            }
            tracing::warn!(
                job_id = %job.job_id,
                quote_id = %quote_id,
                "Source quote missing; billing job total"
            );
        }

        let item = NewLineItem {
            item_type: LineItemType::Service,
            description: job.title.clone(),
            quantity: Decimal::ONE,
            unit: None,
            unit_price: job.billable_total(),
            is_optional: false,
            position: None,
        };
        Ok((vec![item], Decimal::ZERO))
    }
}
