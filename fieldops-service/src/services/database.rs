//! PostgreSQL store for fieldops-service.

use super::store::{Expected, JobUpdate, Store};
use crate::models::{
    ActivityLogEntry, Deposit, DocumentRef, EntityKind, EntityRef, Invoice, InvoiceDetail,
    InvoiceStatus, Job, JobStatus, LineItem, ListWebhookEventsFilter, Payment, Quote, QuoteDetail,
    QuoteStatus, WebhookEvent, WebhookEventStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{}: {}", context, db_err.message()))
        }
        _ => AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e)),
    }
}

fn decode<T>(column: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr<Err = anyhow::Error>,
{
    T::from_str(raw).map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Corrupt {} value '{}': {}", column, raw, e))
    })
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fieldops-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =============================================================================
// Row types
// =============================================================================

const QUOTE_COLUMNS: &str = "quote_id, org_id, quote_number, status, customer_id, customer_name, \
    customer_email, title, site_address, tax_rate, subtotal, tax_total, total, deposit_type, \
    deposit_value, deposit_amount, valid_until, notes, created_utc, updated_utc, sent_utc, \
    viewed_utc, accepted_utc, declined_utc, expired_utc";

#[derive(Debug, FromRow)]
struct QuoteRow {
    quote_id: Uuid,
    org_id: Uuid,
    quote_number: String,
    status: String,
    customer_id: Uuid,
    customer_name: String,
    customer_email: Option<String>,
    title: String,
    site_address: Option<String>,
    tax_rate: Decimal,
    subtotal: Decimal,
    tax_total: Decimal,
    total: Decimal,
    deposit_type: String,
    deposit_value: Option<Decimal>,
    deposit_amount: Decimal,
    valid_until: Option<NaiveDate>,
    notes: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    sent_utc: Option<DateTime<Utc>>,
    viewed_utc: Option<DateTime<Utc>>,
    accepted_utc: Option<DateTime<Utc>>,
    declined_utc: Option<DateTime<Utc>>,
    expired_utc: Option<DateTime<Utc>>,
}

impl TryFrom<QuoteRow> for Quote {
    type Error = AppError;

    fn try_from(row: QuoteRow) -> Result<Self, Self::Error> {
        let deposit = Deposit::from_parts(&row.deposit_type, row.deposit_value)
            .map_err(AppError::DatabaseError)?;
        Ok(Quote {
            quote_id: row.quote_id,
            org_id: row.org_id,
            quote_number: row.quote_number,
            status: decode("quote status", &row.status)?,
            customer_id: row.customer_id,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            title: row.title,
            site_address: row.site_address,
            tax_rate: row.tax_rate,
            subtotal: row.subtotal,
            tax_total: row.tax_total,
            total: row.total,
            deposit,
            deposit_amount: row.deposit_amount,
            valid_until: row.valid_until,
            notes: row.notes,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            sent_utc: row.sent_utc,
            viewed_utc: row.viewed_utc,
            accepted_utc: row.accepted_utc,
            declined_utc: row.declined_utc,
            expired_utc: row.expired_utc,
        })
    }
}

const JOB_COLUMNS: &str = "job_id, org_id, job_number, quote_id, status, customer_id, \
    customer_name, customer_email, title, site_address, quoted_total, actual_total, \
    scheduled_start, scheduled_end, notes, created_utc, updated_utc, started_utc, \
    completed_utc, cancelled_utc, invoiced_utc";

#[derive(Debug, FromRow)]
struct JobRow {
    job_id: Uuid,
    org_id: Uuid,
    job_number: String,
    quote_id: Option<Uuid>,
    status: String,
    customer_id: Uuid,
    customer_name: String,
    customer_email: Option<String>,
    title: String,
    site_address: Option<String>,
    quoted_total: Decimal,
    actual_total: Option<Decimal>,
    scheduled_start: Option<DateTime<Utc>>,
    scheduled_end: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    started_utc: Option<DateTime<Utc>>,
    completed_utc: Option<DateTime<Utc>>,
    cancelled_utc: Option<DateTime<Utc>>,
    invoiced_utc: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            job_id: row.job_id,
            org_id: row.org_id,
            job_number: row.job_number,
            quote_id: row.quote_id,
            status: decode("job status", &row.status)?,
            customer_id: row.customer_id,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            title: row.title,
            site_address: row.site_address,
            quoted_total: row.quoted_total,
            actual_total: row.actual_total,
            scheduled_start: row.scheduled_start,
            scheduled_end: row.scheduled_end,
            notes: row.notes,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            started_utc: row.started_utc,
            completed_utc: row.completed_utc,
            cancelled_utc: row.cancelled_utc,
            invoiced_utc: row.invoiced_utc,
        })
    }
}

const INVOICE_COLUMNS: &str = "invoice_id, org_id, invoice_number, job_id, status, customer_id, \
    customer_name, customer_email, currency, tax_rate, subtotal, tax_total, total, amount_paid, \
    amount_due, issue_date, due_date, notes, created_utc, updated_utc, sent_utc, viewed_utc, \
    paid_utc, cancelled_utc";

#[derive(Debug, FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    org_id: Uuid,
    invoice_number: String,
    job_id: Option<Uuid>,
    status: String,
    customer_id: Uuid,
    customer_name: String,
    customer_email: Option<String>,
    currency: String,
    tax_rate: Decimal,
    subtotal: Decimal,
    tax_total: Decimal,
    total: Decimal,
    amount_paid: Decimal,
    amount_due: Decimal,
    issue_date: Option<NaiveDate>,
    due_date: Option<NaiveDate>,
    notes: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
    sent_utc: Option<DateTime<Utc>>,
    viewed_utc: Option<DateTime<Utc>>,
    paid_utc: Option<DateTime<Utc>>,
    cancelled_utc: Option<DateTime<Utc>>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = AppError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            invoice_id: row.invoice_id,
            org_id: row.org_id,
            invoice_number: row.invoice_number,
            job_id: row.job_id,
            status: decode("invoice status", &row.status)?,
            customer_id: row.customer_id,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            currency: row.currency,
            tax_rate: row.tax_rate,
            subtotal: row.subtotal,
            tax_total: row.tax_total,
            total: row.total,
            amount_paid: row.amount_paid,
            amount_due: row.amount_due,
            issue_date: row.issue_date,
            due_date: row.due_date,
            notes: row.notes,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
            sent_utc: row.sent_utc,
            viewed_utc: row.viewed_utc,
            paid_utc: row.paid_utc,
            cancelled_utc: row.cancelled_utc,
        })
    }
}

const LINE_ITEM_COLUMNS: &str = "line_item_id, org_id, document_kind, document_id, position, \
    item_type, description, quantity, unit, unit_price, line_total, is_optional, created_utc, \
    updated_utc";

#[derive(Debug, FromRow)]
struct LineItemRow {
    line_item_id: Uuid,
    org_id: Uuid,
    document_kind: String,
    document_id: Uuid,
    position: i32,
    item_type: String,
    description: String,
    quantity: Decimal,
    unit: Option<String>,
    unit_price: Decimal,
    line_total: Decimal,
    is_optional: bool,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = AppError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        let document = DocumentRef::from_parts(&row.document_kind, row.document_id)
            .map_err(AppError::DatabaseError)?;
        Ok(LineItem {
            line_item_id: row.line_item_id,
            org_id: row.org_id,
            document,
            position: row.position,
            item_type: decode("line item type", &row.item_type)?,
            description: row.description,
            quantity: row.quantity,
            unit: row.unit,
            unit_price: row.unit_price,
            line_total: row.line_total,
            is_optional: row.is_optional,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct ActivityRow {
    activity_id: Uuid,
    org_id: Uuid,
    entity_kind: String,
    entity_id: Uuid,
    action: String,
    details: Option<String>,
    metadata: serde_json::Value,
    actor_id: Option<Uuid>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<ActivityRow> for ActivityLogEntry {
    type Error = AppError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        Ok(ActivityLogEntry {
            activity_id: row.activity_id,
            org_id: row.org_id,
            entity: EntityRef {
                kind: decode("entity kind", &row.entity_kind)?,
                id: row.entity_id,
            },
            action: row.action,
            details: row.details,
            metadata: row.metadata,
            actor_id: row.actor_id,
            created_utc: row.created_utc,
        })
    }
}

const WEBHOOK_COLUMNS: &str = "webhook_event_id, source, external_event_id, event_type, org_id, \
    status, payload, error_message, attempts, received_utc, last_attempt_utc, processed_utc";

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    webhook_event_id: Uuid,
    source: String,
    external_event_id: String,
    event_type: String,
    org_id: Option<Uuid>,
    status: String,
    payload: String,
    error_message: Option<String>,
    attempts: i32,
    received_utc: DateTime<Utc>,
    last_attempt_utc: Option<DateTime<Utc>>,
    processed_utc: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = AppError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            webhook_event_id: row.webhook_event_id,
            source: row.source,
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            org_id: row.org_id,
            status: decode("webhook status", &row.status)?,
            payload: row.payload,
            error_message: row.error_message,
            attempts: row.attempts,
            received_utc: row.received_utc,
            last_attempt_utc: row.last_attempt_utc,
            processed_utc: row.processed_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    org_id: Uuid,
    invoice_id: Uuid,
    amount: Decimal,
    currency: String,
    provider: String,
    provider_reference: String,
    webhook_event_id: Option<Uuid>,
    received_utc: DateTime<Utc>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            payment_id: row.payment_id,
            org_id: row.org_id,
            invoice_id: row.invoice_id,
            amount: row.amount,
            currency: row.currency,
            provider: row.provider,
            provider_reference: row.provider_reference,
            webhook_event_id: row.webhook_event_id,
            received_utc: row.received_utc,
        }
    }
}

// =============================================================================
// Statements shared by several transactions
// =============================================================================

async fn insert_entries(
    conn: &mut PgConnection,
    entries: &[ActivityLogEntry],
) -> Result<(), AppError> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO activity_log (activity_id, org_id, entity_kind, entity_id, action, details, metadata, actor_id, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.activity_id)
        .bind(entry.org_id)
        .bind(entry.entity.kind.as_str())
        .bind(entry.entity.id)
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(&entry.metadata)
        .bind(entry.actor_id)
        .bind(entry.created_utc)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to append activity"))?;
    }
    Ok(())
}

async fn replace_line_items(
    conn: &mut PgConnection,
    document: DocumentRef,
    items: &[LineItem],
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM line_items WHERE document_kind = $1 AND document_id = $2")
        .bind(document.kind().as_str())
        .bind(document.id())
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to clear line items"))?;

    for item in items {
        sqlx::query(
            r#"
            INSERT INTO line_items (line_item_id, org_id, document_kind, document_id, position, item_type, description, quantity, unit, unit_price, line_total, is_optional, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(item.line_item_id)
        .bind(item.org_id)
        .bind(item.document.kind().as_str())
        .bind(item.document.id())
        .bind(item.position)
        .bind(item.item_type.as_str())
        .bind(&item.description)
        .bind(item.quantity)
        .bind(&item.unit)
        .bind(item.unit_price)
        .bind(item.line_total)
        .bind(item.is_optional)
        .bind(item.created_utc)
        .bind(item.updated_utc)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to insert line item"))?;
    }
    Ok(())
}

async fn delete_document_trail(
    conn: &mut PgConnection,
    org_id: Uuid,
    document: DocumentRef,
) -> Result<(), AppError> {
    sqlx::query("DELETE FROM line_items WHERE document_kind = $1 AND document_id = $2")
        .bind(document.kind().as_str())
        .bind(document.id())
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to delete line items"))?;
    sqlx::query("DELETE FROM activity_log WHERE org_id = $1 AND entity_kind = $2 AND entity_id = $3")
        .bind(org_id)
        .bind(document.kind().as_str())
        .bind(document.id())
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to delete activity"))?;
    Ok(())
}

async fn update_job_row(
    conn: &mut PgConnection,
    job: &Job,
    expected_status: JobStatus,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $3, actual_total = $4, scheduled_start = $5, scheduled_end = $6, notes = $7,
            updated_utc = $8, started_utc = $9, completed_utc = $10, cancelled_utc = $11, invoiced_utc = $12
        WHERE org_id = $1 AND job_id = $2 AND status = $13
        "#,
    )
    .bind(job.org_id)
    .bind(job.job_id)
    .bind(job.status.as_str())
    .bind(job.actual_total)
    .bind(job.scheduled_start)
    .bind(job.scheduled_end)
    .bind(&job.notes)
    .bind(job.updated_utc)
    .bind(job.started_utc)
    .bind(job.completed_utc)
    .bind(job.cancelled_utc)
    .bind(job.invoiced_utc)
    .bind(expected_status.as_str())
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to update job"))?;
    Ok(result.rows_affected() == 1)
}

async fn update_invoice_row(
    conn: &mut PgConnection,
    invoice: &Invoice,
    expected: Expected<InvoiceStatus>,
) -> Result<bool, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET status = $3, customer_email = $4, tax_rate = $5, subtotal = $6, tax_total = $7, total = $8,
            amount_paid = $9, amount_due = $10, issue_date = $11, due_date = $12, notes = $13,
            updated_utc = $14, sent_utc = $15, viewed_utc = $16, paid_utc = $17, cancelled_utc = $18
        WHERE org_id = $1 AND invoice_id = $2 AND status = $19 AND updated_utc = $20
        "#,
    )
    .bind(invoice.org_id)
    .bind(invoice.invoice_id)
    .bind(invoice.status.as_str())
    .bind(&invoice.customer_email)
    .bind(invoice.tax_rate)
    .bind(invoice.subtotal)
    .bind(invoice.tax_total)
    .bind(invoice.total)
    .bind(invoice.amount_paid)
    .bind(invoice.amount_due)
    .bind(invoice.issue_date)
    .bind(invoice.due_date)
    .bind(&invoice.notes)
    .bind(invoice.updated_utc)
    .bind(invoice.sent_utc)
    .bind(invoice.viewed_utc)
    .bind(invoice.paid_utc)
    .bind(invoice.cancelled_utc)
    .bind(expected.status.as_str())
    .bind(expected.updated_utc)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to update invoice"))?;
    Ok(result.rows_affected() == 1)
}

impl Database {
    async fn load_line_items(&self, document: DocumentRef) -> Result<Vec<LineItem>, AppError> {
        let rows = sqlx::query_as::<_, LineItemRow>(&format!(
            "SELECT {} FROM line_items WHERE document_kind = $1 AND document_id = $2 ORDER BY position",
            LINE_ITEM_COLUMNS
        ))
        .bind(document.kind().as_str())
        .bind(document.id())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load line items"))?;

        rows.into_iter().map(LineItem::try_from).collect()
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, AppError> {
        self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })
    }
}

async fn commit(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Result<(), AppError> {
    tx.commit().await.map_err(|e| {
        AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
    })
}

#[async_trait]
impl Store for Database {
    #[instrument(skip(self))]
    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    async fn next_sequence(&self, org_id: Uuid, kind: EntityKind) -> Result<i64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["next_sequence"])
            .start_timer();

        let value = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO document_counters (org_id, entity_kind, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (org_id, entity_kind)
            DO UPDATE SET last_value = document_counters.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(org_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to allocate document number"))?;

        timer.observe_duration();
        Ok(value)
    }

    // ==================== Quotes ====================

    #[instrument(skip(self, detail, entries), fields(quote_id = %detail.quote.quote_id))]
    async fn insert_quote(
        &self,
        detail: &QuoteDetail,
        entries: &[ActivityLogEntry],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_quote"])
            .start_timer();
        let quote = &detail.quote;
        let mut tx = self.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO quotes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)",
            QUOTE_COLUMNS
        ))
        .bind(quote.quote_id)
        .bind(quote.org_id)
        .bind(&quote.quote_number)
        .bind(quote.status.as_str())
        .bind(quote.customer_id)
        .bind(&quote.customer_name)
        .bind(&quote.customer_email)
        .bind(&quote.title)
        .bind(&quote.site_address)
        .bind(quote.tax_rate)
        .bind(quote.subtotal)
        .bind(quote.tax_total)
        .bind(quote.total)
        .bind(quote.deposit.kind())
        .bind(quote.deposit.value())
        .bind(quote.deposit_amount)
        .bind(quote.valid_until)
        .bind(&quote.notes)
        .bind(quote.created_utc)
        .bind(quote.updated_utc)
        .bind(quote.sent_utc)
        .bind(quote.viewed_utc)
        .bind(quote.accepted_utc)
        .bind(quote.declined_utc)
        .bind(quote.expired_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to create quote"))?;

        replace_line_items(&mut tx, DocumentRef::Quote(quote.quote_id), &detail.line_items).await?;
        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        info!(quote_id = %quote.quote_id, quote_number = %quote.quote_number, "Quote created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<Option<QuoteDetail>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_quote"])
            .start_timer();

        let row = sqlx::query_as::<_, QuoteRow>(&format!(
            "SELECT {} FROM quotes WHERE org_id = $1 AND quote_id = $2",
            QUOTE_COLUMNS
        ))
        .bind(org_id)
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get quote"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let quote = Quote::try_from(row)?;
        let line_items = self.load_line_items(DocumentRef::Quote(quote_id)).await?;

        timer.observe_duration();
        Ok(Some(QuoteDetail { quote, line_items }))
    }

    #[instrument(skip(self, quote, line_items, entries), fields(quote_id = %quote.quote_id))]
    async fn update_quote(
        &self,
        quote: &Quote,
        expected: Expected<QuoteStatus>,
        line_items: Option<&[LineItem]>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_quote"])
            .start_timer();
        let mut tx = self.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE quotes
            SET status = $3, customer_email = $4, tax_rate = $5, subtotal = $6, tax_total = $7, total = $8,
                deposit_type = $9, deposit_value = $10, deposit_amount = $11, valid_until = $12, notes = $13,
                updated_utc = $14, sent_utc = $15, viewed_utc = $16, accepted_utc = $17, declined_utc = $18,
                expired_utc = $19
            WHERE org_id = $1 AND quote_id = $2 AND status = $20 AND updated_utc = $21
            "#,
        )
        .bind(quote.org_id)
        .bind(quote.quote_id)
        .bind(quote.status.as_str())
        .bind(&quote.customer_email)
        .bind(quote.tax_rate)
        .bind(quote.subtotal)
        .bind(quote.tax_total)
        .bind(quote.total)
        .bind(quote.deposit.kind())
        .bind(quote.deposit.value())
        .bind(quote.deposit_amount)
        .bind(quote.valid_until)
        .bind(&quote.notes)
        .bind(quote.updated_utc)
        .bind(quote.sent_utc)
        .bind(quote.viewed_utc)
        .bind(quote.accepted_utc)
        .bind(quote.declined_utc)
        .bind(quote.expired_utc)
        .bind(expected.status.as_str())
        .bind(expected.updated_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to update quote"))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(false);
        }
        if let Some(items) = line_items {
            replace_line_items(&mut tx, DocumentRef::Quote(quote.quote_id), items).await?;
        }
        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn delete_draft_quote(&self, org_id: Uuid, quote_id: Uuid) -> Result<bool, AppError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "DELETE FROM quotes WHERE org_id = $1 AND quote_id = $2 AND status = $3",
        )
        .bind(org_id)
        .bind(quote_id)
        .bind(QuoteStatus::Draft.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to delete quote"))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(false);
        }
        delete_document_trail(&mut tx, org_id, DocumentRef::Quote(quote_id)).await?;
        commit(tx).await?;
        Ok(true)
    }

    // ==================== Jobs ====================

    #[instrument(skip(self, job, entries), fields(job_id = %job.job_id))]
    async fn insert_job(&self, job: &Job, entries: &[ActivityLogEntry]) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_job"])
            .start_timer();
        let mut tx = self.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO jobs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
            JOB_COLUMNS
        ))
        .bind(job.job_id)
        .bind(job.org_id)
        .bind(&job.job_number)
        .bind(job.quote_id)
        .bind(job.status.as_str())
        .bind(job.customer_id)
        .bind(&job.customer_name)
        .bind(&job.customer_email)
        .bind(&job.title)
        .bind(&job.site_address)
        .bind(job.quoted_total)
        .bind(job.actual_total)
        .bind(job.scheduled_start)
        .bind(job.scheduled_end)
        .bind(&job.notes)
        .bind(job.created_utc)
        .bind(job.updated_utc)
        .bind(job.started_utc)
        .bind(job.completed_utc)
        .bind(job.cancelled_utc)
        .bind(job.invoiced_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to create job"))?;

        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        info!(job_id = %job.job_id, job_number = %job.job_number, "Job created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job"])
            .start_timer();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE org_id = $1 AND job_id = $2",
            JOB_COLUMNS
        ))
        .bind(org_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get job"))?;

        timer.observe_duration();
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn find_job_by_quote(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
    ) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE org_id = $1 AND quote_id = $2",
            JOB_COLUMNS
        ))
        .bind(org_id)
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find job by quote"))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, job, entries), fields(job_id = %job.job_id))]
    async fn update_job(
        &self,
        job: &Job,
        expected_status: JobStatus,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_job"])
            .start_timer();
        let mut tx = self.begin().await?;

        if !update_job_row(&mut tx, job, expected_status).await? {
            tx.rollback().await.ok();
            return Ok(false);
        }
        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        Ok(true)
    }

    // ==================== Invoices ====================

    #[instrument(skip(self, detail, job_update, entries), fields(invoice_id = %detail.invoice.invoice_id))]
    async fn insert_invoice(
        &self,
        detail: &InvoiceDetail,
        job_update: Option<&JobUpdate>,
        entries: &[ActivityLogEntry],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();
        let invoice = &detail.invoice;
        let mut tx = self.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO invoices ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)",
            INVOICE_COLUMNS
        ))
        .bind(invoice.invoice_id)
        .bind(invoice.org_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.job_id)
        .bind(invoice.status.as_str())
        .bind(invoice.customer_id)
        .bind(&invoice.customer_name)
        .bind(&invoice.customer_email)
        .bind(&invoice.currency)
        .bind(invoice.tax_rate)
        .bind(invoice.subtotal)
        .bind(invoice.tax_total)
        .bind(invoice.total)
        .bind(invoice.amount_paid)
        .bind(invoice.amount_due)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(&invoice.notes)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .bind(invoice.sent_utc)
        .bind(invoice.viewed_utc)
        .bind(invoice.paid_utc)
        .bind(invoice.cancelled_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to create invoice"))?;

        if let Some(update) = job_update {
            if !update_job_row(&mut tx, &update.job, update.expected_status).await? {
                tx.rollback().await.ok();
                return Err(AppError::InvalidState(anyhow::anyhow!(
                    "Job {} is no longer {}",
                    update.job.job_number,
                    update.expected_status
                )));
            }
        }

        replace_line_items(
            &mut tx,
            DocumentRef::Invoice(invoice.invoice_id),
            &detail.line_items,
        )
        .await?;
        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            "Invoice created"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceDetail>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE org_id = $1 AND invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(org_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get invoice"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let invoice = Invoice::try_from(row)?;
        let line_items = self
            .load_line_items(DocumentRef::Invoice(invoice_id))
            .await?;

        timer.observe_duration();
        Ok(Some(InvoiceDetail {
            invoice,
            line_items,
        }))
    }

    #[instrument(skip(self))]
    async fn find_invoice_by_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {} FROM invoices WHERE org_id = $1 AND job_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(org_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find invoice by job"))?;

        row.map(Invoice::try_from).transpose()
    }

    #[instrument(skip(self, invoice, line_items, entries), fields(invoice_id = %invoice.invoice_id))]
    async fn update_invoice(
        &self,
        invoice: &Invoice,
        expected: Expected<InvoiceStatus>,
        line_items: Option<&[LineItem]>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();
        let mut tx = self.begin().await?;

        if !update_invoice_row(&mut tx, invoice, expected).await? {
            tx.rollback().await.ok();
            return Ok(false);
        }
        if let Some(items) = line_items {
            replace_line_items(&mut tx, DocumentRef::Invoice(invoice.invoice_id), items).await?;
        }
        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn delete_draft_invoice(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<bool, AppError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "DELETE FROM invoices WHERE org_id = $1 AND invoice_id = $2 AND status = $3",
        )
        .bind(org_id)
        .bind(invoice_id)
        .bind(InvoiceStatus::Draft.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to delete invoice"))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(false);
        }
        delete_document_trail(&mut tx, org_id, DocumentRef::Invoice(invoice_id)).await?;
        commit(tx).await?;
        Ok(true)
    }

    // ==================== Payments ====================

    #[instrument(skip(self))]
    async fn find_payment(
        &self,
        org_id: Uuid,
        provider: &str,
        provider_reference: &str,
    ) -> Result<Option<Payment>, AppError> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT payment_id, org_id, invoice_id, amount, currency, provider, provider_reference, webhook_event_id, received_utc
            FROM payments
            WHERE org_id = $1 AND provider = $2 AND provider_reference = $3
            "#,
        )
        .bind(org_id)
        .bind(provider)
        .bind(provider_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find payment"))?;

        Ok(row.map(Payment::from))
    }

    #[instrument(skip(self, payment, invoice, entries), fields(invoice_id = %invoice.invoice_id))]
    async fn record_payment(
        &self,
        payment: &Payment,
        invoice: &Invoice,
        expected: Expected<InvoiceStatus>,
        entries: &[ActivityLogEntry],
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payments (payment_id, org_id, invoice_id, amount, currency, provider, provider_reference, webhook_event_id, received_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.org_id)
        .bind(payment.invoice_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.provider)
        .bind(&payment.provider_reference)
        .bind(payment.webhook_event_id)
        .bind(payment.received_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to record payment"))?;

        if !update_invoice_row(&mut tx, invoice, expected).await? {
            tx.rollback().await.ok();
            return Ok(false);
        }
        insert_entries(&mut tx, entries).await?;
        commit(tx).await?;

        timer.observe_duration();
        Ok(true)
    }

    // ==================== Activity ====================

    async fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to acquire connection: {}", e))
        })?;
        insert_entries(&mut conn, std::slice::from_ref(entry)).await
    }

    #[instrument(skip(self))]
    async fn list_activity(
        &self,
        org_id: Uuid,
        entity: EntityRef,
    ) -> Result<Vec<ActivityLogEntry>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_activity"])
            .start_timer();

        let rows = sqlx::query_as::<_, ActivityRow>(
            r#"
            SELECT activity_id, org_id, entity_kind, entity_id, action, details, metadata, actor_id, created_utc
            FROM activity_log
            WHERE org_id = $1 AND entity_kind = $2 AND entity_id = $3
            ORDER BY created_utc, seq
            "#,
        )
        .bind(org_id)
        .bind(entity.kind.as_str())
        .bind(entity.id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list activity"))?;

        timer.observe_duration();
        rows.into_iter().map(ActivityLogEntry::try_from).collect()
    }

    // ==================== Webhook events ====================

    #[instrument(skip(self, event), fields(source = %event.source, external_event_id = %event.external_event_id))]
    async fn insert_webhook_event(&self, event: &WebhookEvent) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_webhook_event"])
            .start_timer();

        sqlx::query(&format!(
            "INSERT INTO webhook_events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            WEBHOOK_COLUMNS
        ))
        .bind(event.webhook_event_id)
        .bind(&event.source)
        .bind(&event.external_event_id)
        .bind(&event.event_type)
        .bind(event.org_id)
        .bind(event.status.as_str())
        .bind(&event.payload)
        .bind(&event.error_message)
        .bind(event.attempts)
        .bind(event.received_utc)
        .bind(event.last_attempt_utc)
        .bind(event.processed_utc)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record webhook event"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn get_webhook_event(
        &self,
        webhook_event_id: Uuid,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let row = sqlx::query_as::<_, WebhookEventRow>(&format!(
            "SELECT {} FROM webhook_events WHERE webhook_event_id = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(webhook_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get webhook event"))?;

        row.map(WebhookEvent::try_from).transpose()
    }

    async fn find_webhook_event(
        &self,
        source: &str,
        external_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let row = sqlx::query_as::<_, WebhookEventRow>(&format!(
            "SELECT {} FROM webhook_events WHERE source = $1 AND external_event_id = $2",
            WEBHOOK_COLUMNS
        ))
        .bind(source)
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find webhook event"))?;

        row.map(WebhookEvent::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn claim_webhook_event(
        &self,
        webhook_event_id: Uuid,
        expected_status: WebhookEventStatus,
        expected_attempts: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let row = sqlx::query_as::<_, WebhookEventRow>(&format!(
            r#"
            UPDATE webhook_events
            SET status = $4, attempts = attempts + 1, last_attempt_utc = $5
            WHERE webhook_event_id = $1 AND status = $2 AND attempts = $3
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(webhook_event_id)
        .bind(expected_status.as_str())
        .bind(expected_attempts)
        .bind(WebhookEventStatus::Received.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to claim webhook event"))?;

        row.map(WebhookEvent::try_from).transpose()
    }

    #[instrument(skip(self, event), fields(webhook_event_id = %event.webhook_event_id, status = %event.status))]
    async fn finish_webhook_event(&self, event: &WebhookEvent) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, org_id = $3, error_message = $4, processed_utc = $5
            WHERE webhook_event_id = $1
            "#,
        )
        .bind(event.webhook_event_id)
        .bind(event.status.as_str())
        .bind(event.org_id)
        .bind(&event.error_message)
        .bind(event.processed_utc)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to update webhook event"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_webhook_events"])
            .start_timer();

        let rows = sqlx::query_as::<_, WebhookEventRow>(&format!(
            r#"
            SELECT {}
            FROM webhook_events
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source = $2)
            ORDER BY received_utc DESC
            LIMIT $3
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.source.as_deref())
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list webhook events"))?;

        timer.observe_duration();
        rows.into_iter().map(WebhookEvent::try_from).collect()
    }
}
