use crate::models::{Invoice, Quote};
use async_trait::async_trait;
use service_core::error::AppError;

/// Delivers customer-facing messages when a document is sent.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn quote_sent(&self, quote: &Quote) -> Result<(), AppError>;

    async fn invoice_sent(&self, invoice: &Invoice) -> Result<(), AppError>;
}

/// Notifier that only writes a log line. Used when no delivery channel is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn quote_sent(&self, quote: &Quote) -> Result<(), AppError> {
        tracing::info!(
            quote_id = %quote.quote_id,
            quote_number = %quote.quote_number,
            to = ?quote.customer_email,
            "Quote notification queued"
        );
        Ok(())
    }

    async fn invoice_sent(&self, invoice: &Invoice) -> Result<(), AppError> {
        tracing::info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            to = ?invoice.customer_email,
            "Invoice notification queued"
        );
        Ok(())
    }
}
