//! Per-event-type webhook handlers.

use super::envelope::Envelope;
use crate::models::{EntityRef, InvoiceStatus, Payment, WebhookEvent};
use crate::services::activity::ActivityRecorder;
use crate::services::store::{Expected, Store};
use crate::services::totals::check_amount;
use crate::services::transitions::StatusTransitionValidator;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &WebhookEvent, envelope: &Envelope) -> Result<(), AppError>;
}

/// Handlers keyed by event type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the payment handlers.
    pub fn standard(store: Arc<dyn Store>, validator: Arc<StatusTransitionValidator>) -> Self {
        let mut registry = Self::new();
        registry.register(
            &["payment.succeeded", "payment.captured", "payment_intent.succeeded"],
            Arc::new(PaymentSucceededHandler::new(store.clone(), validator)),
        );
        registry.register(
            &["payment.failed", "payment_intent.payment_failed"],
            Arc::new(PaymentFailedHandler::new(store)),
        );
        registry
    }

    pub fn register(&mut self, event_types: &[&str], handler: Arc<dyn WebhookHandler>) {
        for event_type in event_types {
            self.handlers.insert(event_type.to_string(), handler.clone());
        }
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(event_type).cloned()
    }
}

fn payload_error(message: String) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(message))
}

fn require_org(envelope: &Envelope) -> Result<Uuid, AppError> {
    envelope
        .org_id
        .ok_or_else(|| payload_error("Payment event has no data.org_id".to_string()))
}

/// Records a payment and settles the invoice once fully paid.
///
/// Safe to re-run: a payment already recorded under the same provider
/// reference is left as is.
pub struct PaymentSucceededHandler {
    store: Arc<dyn Store>,
    validator: Arc<StatusTransitionValidator>,
}

impl PaymentSucceededHandler {
    pub fn new(store: Arc<dyn Store>, validator: Arc<StatusTransitionValidator>) -> Self {
        Self { store, validator }
    }
}

#[async_trait]
impl WebhookHandler for PaymentSucceededHandler {
    async fn handle(&self, event: &WebhookEvent, envelope: &Envelope) -> Result<(), AppError> {
        let org_id = require_org(envelope)?;
        let invoice_id = envelope.data_uuid("invoice_id").map_err(payload_error)?;
        let amount = envelope.data_decimal("amount").map_err(payload_error)?;
        if amount <= Decimal::ZERO {
            return Err(payload_error(format!("Payment amount must be positive, got {}", amount)));
        }
        check_amount("Payment amount", amount)?;
        let provider = event.source.as_str();
        let reference = envelope
            .data_string(&["payment_id", "reference", "id"])
            .unwrap_or_else(|| event.external_event_id.clone());

        if self
            .store
            .find_payment(org_id, provider, &reference)
            .await?
            .is_some()
        {
            tracing::info!(
                invoice_id = %invoice_id,
                reference = %reference,
                "Payment already recorded"
            );
            return Ok(());
        }

        let detail = self
            .store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        let now = Utc::now();
        let effective = detail.invoice.effective_status(now.date_naive());
        if !matches!(
            effective,
            InvoiceStatus::Sent | InvoiceStatus::Viewed | InvoiceStatus::Overdue
        ) {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Cannot record payment against {} invoice {}",
                effective,
                detail.invoice.invoice_number
            )));
        }

        let currency = envelope
            .data_string(&["currency"])
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| detail.invoice.currency.clone());
        if currency != detail.invoice.currency {
            return Err(payload_error(format!(
                "Payment currency {} does not match invoice currency {}",
                currency, detail.invoice.currency
            )));
        }

        let expected = Expected::invoice(&detail.invoice);
        let mut settled = detail.clone();
        let amount_paid = detail
            .invoice
            .amount_paid
            .checked_add(amount)
            .ok_or_else(|| payload_error("Amount paid exceeds the supported amount range".to_string()))?;
        settled.invoice.amount_paid = check_amount("Amount paid", amount_paid)?;
        settled.invoice.amount_due =
            (settled.invoice.total - settled.invoice.amount_paid).max(Decimal::ZERO);
        settled.invoice.updated_utc = now;

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            org_id,
            invoice_id,
            amount,
            currency,
            provider: provider.to_string(),
            provider_reference: reference,
            webhook_event_id: Some(event.webhook_event_id),
            received_utc: now,
        };

        let mut entries = vec![ActivityRecorder::entry(
            org_id,
            EntityRef::invoice(invoice_id),
            "Payment received",
            Some(format!("{} {} via {}", payment.amount, payment.currency, provider)),
            json!({
                "payment_id": payment.payment_id,
                "amount": payment.amount,
                "provider_reference": payment.provider_reference,
                "webhook_event_id": event.webhook_event_id,
            }),
            None,
            now,
        )];

        if settled.invoice.amount_due.is_zero() {
            let (paid, entry) =
                self.validator
                    .apply_transition(&settled, InvoiceStatus::Paid, None, now)?;
            settled = paid;
            entries.push(entry);
        }

        match self
            .store
            .record_payment(&payment, &settled.invoice, expected, &entries)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(AppError::InvalidState(anyhow::anyhow!(
                    "Invoice {} changed while recording payment",
                    settled.invoice.invoice_number
                )))
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(invoice_id = %invoice_id, "Payment recorded concurrently");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            invoice_id = %invoice_id,
            amount = %payment.amount,
            amount_due = %settled.invoice.amount_due,
            status = %settled.invoice.status,
            "Payment recorded"
        );
        Ok(())
    }
}

/// Notes a failed payment attempt on the invoice.
pub struct PaymentFailedHandler {
    store: Arc<dyn Store>,
}

impl PaymentFailedHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl WebhookHandler for PaymentFailedHandler {
    async fn handle(&self, event: &WebhookEvent, envelope: &Envelope) -> Result<(), AppError> {
        let org_id = require_org(envelope)?;
        let invoice_id = envelope.data_uuid("invoice_id").map_err(payload_error)?;

        if self.store.get_invoice(org_id, invoice_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                invoice_id
            )));
        }

        let reason = envelope
            .data_string(&["failure_reason", "reason", "error"])
            .unwrap_or_else(|| "No reason given".to_string());
        let entry = ActivityRecorder::entry(
            org_id,
            EntityRef::invoice(invoice_id),
            "Payment failed",
            Some(reason.clone()),
            json!({
                "provider": event.source,
                "reason": reason,
                "webhook_event_id": event.webhook_event_id,
            }),
            None,
            Utc::now(),
        );
        self.store.append_activity(&entry).await?;

        tracing::warn!(invoice_id = %invoice_id, reason = %reason, "Payment failed");
        Ok(())
    }
}
