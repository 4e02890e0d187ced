//! Job model for fieldops-service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
    Invoiced,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::InProgress,
        JobStatus::OnHold,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::Invoiced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::InProgress => "in_progress",
            JobStatus::OnHold => "on_hold",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Invoiced => "invoiced",
        }
    }

    /// Whether an invoice may be raised for a job in this status.
    pub fn is_billable(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Invoiced)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown job status '{}'", s))
    }
}

/// Job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub org_id: Uuid,
    pub job_number: String,
    pub quote_id: Option<Uuid>,
    pub status: JobStatus,
    pub customer_id: Uuid,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub title: String,
    pub site_address: Option<String>,
    pub quoted_total: Decimal,
    pub actual_total: Option<Decimal>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub scheduled_end: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub started_utc: Option<DateTime<Utc>>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub cancelled_utc: Option<DateTime<Utc>>,
    pub invoiced_utc: Option<DateTime<Utc>>,
}

impl Job {
    /// Amount to bill when no quote line items are available.
    pub fn billable_total(&self) -> Decimal {
        self.actual_total.unwrap_or(self.quoted_total)
    }
}

/// Input for creating a job manually.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateJob {
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
    pub quoted_total: Decimal,
    #[serde(default)]
    pub actual_total: Option<Decimal>,
    #[serde(default)]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Only `pending` or `scheduled` are accepted; defaults to `scheduled`.
    #[serde(default)]
    pub status: Option<JobStatus>,
}
