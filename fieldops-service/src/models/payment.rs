//! Payment model for fieldops-service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Money received against an invoice, as reported by a payment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: Uuid,
    pub org_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub provider: String,
    /// Unique per organization and provider.
    pub provider_reference: String,
    pub webhook_event_id: Option<Uuid>,
    pub received_utc: DateTime<Utc>,
}
