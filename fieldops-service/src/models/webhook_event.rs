//! Webhook event model for fieldops-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Processing state of a received webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Received => "received",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(WebhookEventStatus::Received),
            "processed" => Ok(WebhookEventStatus::Processed),
            "failed" => Ok(WebhookEventStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown webhook event status '{}'", other)),
        }
    }
}

/// A webhook delivery, stored with its raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub webhook_event_id: Uuid,
    pub source: String,
    /// Provider event identifier, or `sha256:<digest>` when the payload carried none.
    pub external_event_id: String,
    pub event_type: String,
    pub org_id: Option<Uuid>,
    pub status: WebhookEventStatus,
    pub payload: String,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub received_utc: DateTime<Utc>,
    pub last_attempt_utc: Option<DateTime<Utc>>,
    pub processed_utc: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// Whether a `received` event has been in flight long enough to be reclaimed.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        let started = self.last_attempt_utc.unwrap_or(self.received_utc);
        self.status == WebhookEventStatus::Received && now - started >= stale_after
    }

    /// Whether a new processing attempt may claim this event.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == WebhookEventStatus::Failed || self.is_stale(now, stale_after)
    }
}

/// Filter parameters for listing webhook events.
#[derive(Debug, Clone, Deserialize)]
pub struct ListWebhookEventsFilter {
    #[serde(default)]
    pub status: Option<WebhookEventStatus>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for ListWebhookEventsFilter {
    fn default() -> Self {
        Self {
            status: None,
            source: None,
            limit: default_limit(),
        }
    }
}

fn default_limit() -> i64 {
    50
}

/// Response body for a recorded delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub webhook_event_id: Uuid,
    pub status: WebhookEventStatus,
}

impl From<&WebhookEvent> for WebhookAck {
    fn from(event: &WebhookEvent) -> Self {
        Self {
            webhook_event_id: event.webhook_event_id,
            status: event.status,
        }
    }
}
