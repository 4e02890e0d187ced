//! Quote model for fieldops-service.

use super::{LineItem, NewLineItem};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Quote status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Viewed,
    Accepted,
    Declined,
    Expired,
}

impl QuoteStatus {
    pub const ALL: [QuoteStatus; 6] = [
        QuoteStatus::Draft,
        QuoteStatus::Sent,
        QuoteStatus::Viewed,
        QuoteStatus::Accepted,
        QuoteStatus::Declined,
        QuoteStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Draft => "draft",
            QuoteStatus::Sent => "sent",
            QuoteStatus::Viewed => "viewed",
            QuoteStatus::Accepted => "accepted",
            QuoteStatus::Declined => "declined",
            QuoteStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuoteStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown quote status '{}'", s))
    }
}

/// Deposit requested upfront. A fixed amount or a percentage of total, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Deposit {
    #[default]
    None,
    Fixed(Decimal),
    Percentage(Decimal),
}

impl Deposit {
    pub fn kind(&self) -> &'static str {
        match self {
            Deposit::None => "none",
            Deposit::Fixed(_) => "fixed",
            Deposit::Percentage(_) => "percentage",
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        match self {
            Deposit::None => None,
            Deposit::Fixed(v) | Deposit::Percentage(v) => Some(*v),
        }
    }

    /// Rebuild deposit terms from their stored columns.
    pub fn from_parts(kind: &str, value: Option<Decimal>) -> Result<Self, anyhow::Error> {
        match (kind, value) {
            ("none", _) => Ok(Deposit::None),
            ("fixed", Some(v)) => Ok(Deposit::Fixed(v)),
            ("percentage", Some(v)) => Ok(Deposit::Percentage(v)),
            (kind, _) => Err(anyhow::anyhow!("Invalid deposit terms '{}'", kind)),
        }
    }

    /// Check the amount is usable: non-negative, and at most 100 for percentages.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Deposit::None => Ok(()),
            Deposit::Fixed(v) if v.is_sign_negative() && !v.is_zero() => {
                Err("Fixed deposit cannot be negative".to_string())
            }
            Deposit::Percentage(v) if *v < Decimal::ZERO || *v > Decimal::ONE_HUNDRED => {
                Err("Deposit percentage must be between 0 and 100".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Quote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: Uuid,
    pub org_id: Uuid,
    pub quote_number: String,
    pub status: QuoteStatus,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub title: String,
    pub site_address: Option<String>,
    pub tax_rate: Decimal,
    pub subtotal: Decimal,
    pub tax_total: Decimal,
    pub total: Decimal,
    pub deposit: Deposit,
    pub deposit_amount: Decimal,
    pub valid_until: Option<NaiveDate>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub sent_utc: Option<DateTime<Utc>>,
    pub viewed_utc: Option<DateTime<Utc>>,
    pub accepted_utc: Option<DateTime<Utc>>,
    pub declined_utc: Option<DateTime<Utc>>,
    pub expired_utc: Option<DateTime<Utc>>,
}

/// A quote together with its ordered line items.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteDetail {
    #[serde(flatten)]
    pub quote: Quote,
    pub line_items: Vec<LineItem>,
}

/// Input for creating a quote.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateQuote {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "Customer name is required"))]
    pub customer_name: String,
    #[serde(default)]
    #[validate(email(message = "Invalid email format"))]
    pub customer_email: Option<String>,
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,
    #[serde(default)]
    pub site_address: Option<String>,
    #[serde(default)]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub deposit: Deposit,
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub line_items: Vec<NewLineItem>,
}
