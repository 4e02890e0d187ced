//! Creation, lookup and deletion of quotes, jobs and invoices.

use super::activity::ActivityRecorder;
use super::line_items::build_items;
use super::store::Store;
use super::totals::compute_totals;
use crate::models::{
    CreateInvoice, CreateJob, CreateQuote, Deposit, DocumentRef, EntityKind, EntityRef, Invoice,
    InvoiceDetail, InvoiceStatus, Job, JobStatus, Quote, QuoteDetail, QuoteStatus,
};
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone)]
pub struct DocumentService {
    store: Arc<dyn Store>,
    payment_terms_days: i64,
}

fn check_tax_rate(tax_rate: Decimal) -> Result<(), AppError> {
    if tax_rate < Decimal::ZERO || tax_rate > Decimal::ONE_HUNDRED {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Tax rate must be between 0 and 100, got {}",
            tax_rate
        )));
    }
    Ok(())
}

impl DocumentService {
    pub fn new(store: Arc<dyn Store>, payment_terms_days: i64) -> Self {
        Self {
            store,
            payment_terms_days,
        }
    }

    /// Due date for an invoice raised today.
    pub fn default_due_date(&self, today: NaiveDate) -> NaiveDate {
        today + Duration::days(self.payment_terms_days)
    }

    /// Allocate the next human-readable number for `kind` in the organization.
    pub async fn next_number(&self, org_id: Uuid, kind: EntityKind) -> Result<String, AppError> {
        let sequence = self.store.next_sequence(org_id, kind).await?;
        Ok(kind.format_number(sequence))
    }

    // ==================== Quotes ====================

    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    pub async fn create_quote(
        &self,
        org_id: Uuid,
        input: CreateQuote,
        actor_id: Option<Uuid>,
    ) -> Result<QuoteDetail, AppError> {
        check_tax_rate(input.tax_rate)?;
        input
            .deposit
            .validate()
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

        let now = Utc::now();
        let quote_id = Uuid::new_v4();
        let line_items = build_items(org_id, DocumentRef::Quote(quote_id), &input.line_items, now)?;
        let totals = compute_totals(&line_items, input.tax_rate, &input.deposit)?;
        let quote_number = self.next_number(org_id, EntityKind::Quote).await?;

        let quote = Quote {
            quote_id,
            org_id,
            quote_number,
            status: QuoteStatus::Draft,
            customer_id: input.customer_id,
            customer_name: input.customer_name,
            customer_email: input.customer_email,
            title: input.title,
            site_address: input.site_address,
            tax_rate: input.tax_rate,
            subtotal: totals.subtotal,
            tax_total: totals.tax,
            total: totals.total,
            deposit: input.deposit,
            deposit_amount: totals.deposit_amount,
            valid_until: input.valid_until,
            notes: input.notes,
            created_utc: now,
            updated_utc: now,
            sent_utc: None,
            viewed_utc: None,
            accepted_utc: None,
            declined_utc: None,
            expired_utc: None,
        };
        let entry = ActivityRecorder::created(
            org_id,
            EntityRef::quote(quote_id),
            &quote.quote_number,
            actor_id,
            now,
        );
        let detail = QuoteDetail { quote, line_items };

        self.store.insert_quote(&detail, &[entry]).await?;

        tracing::info!(
            quote_id = %quote_id,
            quote_number = %detail.quote.quote_number,
            total = %detail.quote.total,
            "Quote created"
        );
        Ok(detail)
    }

    pub async fn get_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<QuoteDetail, AppError> {
        self.store
            .get_quote(org_id, quote_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Quote not found")))
    }

    #[instrument(skip(self))]
    pub async fn delete_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<(), AppError> {
        let detail = self.get_quote(org_id, quote_id).await?;
        if detail.quote.status != QuoteStatus::Draft
            || !self.store.delete_draft_quote(org_id, quote_id).await?
        {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Only draft quotes can be deleted"
            )));
        }
        tracing::info!(quote_id = %quote_id, "Quote deleted");
        Ok(())
    }

    // ==================== Jobs ====================

    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    pub async fn create_job(
        &self,
        org_id: Uuid,
        input: CreateJob,
        actor_id: Option<Uuid>,
    ) -> Result<Job, AppError> {
        let status = match input.status.unwrap_or(JobStatus::Scheduled) {
            status @ (JobStatus::Pending | JobStatus::Scheduled) => status,
            other => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Jobs start as pending or scheduled, not {}",
                    other
                )))
            }
        };
        if input.quoted_total < Decimal::ZERO
            || input.actual_total.is_some_and(|t| t < Decimal::ZERO)
        {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Job totals cannot be negative"
            )));
        }
        if let (Some(start), Some(end)) = (input.scheduled_start, input.scheduled_end) {
            if end < start {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Scheduled end is before scheduled start"
                )));
            }
        }

        let now = Utc::now();
        let job_number = self.next_number(org_id, EntityKind::Job).await?;
        let job = Job {
            job_id: Uuid::new_v4(),
            org_id,
            job_number,
            quote_id: None,
            status,
            customer_id: input.customer_id,
            customer_name: input.customer_name,
            customer_email: input.customer_email,
            title: input.title,
            site_address: input.site_address,
            quoted_total: input.quoted_total,
            actual_total: input.actual_total,
            scheduled_start: input.scheduled_start,
            scheduled_end: input.scheduled_end,
            notes: input.notes,
            created_utc: now,
            updated_utc: now,
            started_utc: None,
            completed_utc: None,
            cancelled_utc: None,
            invoiced_utc: None,
        };
        let entry = ActivityRecorder::created(
            org_id,
            EntityRef::job(job.job_id),
            &job.job_number,
            actor_id,
            now,
        );

        self.store.insert_job(&job, &[entry]).await?;

        tracing::info!(job_id = %job.job_id, job_number = %job.job_number, "Job created");
        Ok(job)
    }

    pub async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Job, AppError> {
        self.store
            .get_job(org_id, job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Job not found")))
    }

    // ==================== Invoices ====================

    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    pub async fn create_invoice(
        &self,
        org_id: Uuid,
        input: CreateInvoice,
        actor_id: Option<Uuid>,
    ) -> Result<InvoiceDetail, AppError> {
        check_tax_rate(input.tax_rate)?;

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let line_items = build_items(
            org_id,
            DocumentRef::Invoice(invoice_id),
            &input.line_items,
            now,
        )?;
        let totals = compute_totals(&line_items, input.tax_rate, &Deposit::None)?;
        let invoice_number = self.next_number(org_id, EntityKind::Invoice).await?;

        let invoice = Invoice {
            invoice_id,
            org_id,
            invoice_number,
            job_id: None,
            status: InvoiceStatus::Draft,
            customer_id: input.customer_id,
            customer_name: input.customer_name,
            customer_email: input.customer_email,
            currency: input.currency.to_uppercase(),
            tax_rate: input.tax_rate,
            subtotal: totals.subtotal,
            tax_total: totals.tax,
            total: totals.total,
            amount_paid: Decimal::ZERO,
            amount_due: totals.total,
            issue_date: None,
            due_date: Some(
                input
                    .due_date
                    .unwrap_or_else(|| self.default_due_date(now.date_naive())),
            ),
            notes: input.notes,
            created_utc: now,
            updated_utc: now,
            sent_utc: None,
            viewed_utc: None,
            paid_utc: None,
            cancelled_utc: None,
        };
        let entry = ActivityRecorder::created(
            org_id,
            EntityRef::invoice(invoice_id),
            &invoice.invoice_number,
            actor_id,
            now,
        );
        let detail = InvoiceDetail {
            invoice,
            line_items,
        };

        self.store.insert_invoice(&detail, None, &[entry]).await?;

        tracing::info!(
            invoice_id = %invoice_id,
            invoice_number = %detail.invoice.invoice_number,
            total = %detail.invoice.total,
            "Invoice created"
        );
        Ok(detail)
    }

    /// Invoice with its derived status applied.
    pub async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<InvoiceDetail, AppError> {
        let detail = self
            .store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        Ok(InvoiceDetail {
            invoice: detail.invoice.with_effective_status(Utc::now().date_naive()),
            line_items: detail.line_items,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_invoice(&self, org_id: Uuid, invoice_id: Uuid) -> Result<(), AppError> {
        let detail = self.get_invoice(org_id, invoice_id).await?;
        if detail.invoice.status != InvoiceStatus::Draft
            || !self.store.delete_draft_invoice(org_id, invoice_id).await?
        {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Only draft invoices can be deleted"
            )));
        }
        tracing::info!(invoice_id = %invoice_id, "Invoice deleted");
        Ok(())
    }
}
