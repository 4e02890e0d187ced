//! Status transition tables and the validator that applies them.
//!
//! Each document kind owns an immutable [`TransitionTable`] built once at startup.
//! Every status maps to exactly one [`Exit`] rule, so a status with no outgoing
//! edges has to be declared [`Exit::Terminal`] (or [`Exit::Conversion`]) rather
//! than left with an empty target list.

use crate::models::{
    ActivityLogEntry, EntityKind, EntityRef, Invoice, InvoiceDetail, InvoiceStatus, Job,
    JobStatus, QuoteDetail, QuoteStatus,
};
use crate::services::activity::ActivityRecorder;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Outgoing rule for one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit<S: 'static> {
    /// Directly reachable statuses. Never empty.
    To(&'static [S]),
    /// No direct exits; the document leaves its lifecycle through conversion.
    Conversion,
    /// No exits at all.
    Terminal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("{kind} status '{status}' has no exit rule")]
    MissingRule { kind: EntityKind, status: &'static str },

    #[error("{kind} status '{status}' has more than one exit rule")]
    DuplicateRule { kind: EntityKind, status: &'static str },

    #[error("{kind} status '{status}' lists itself as a target")]
    SelfTransition { kind: EntityKind, status: &'static str },

    #[error("{kind} status '{status}' has an empty target set")]
    EmptyTargets { kind: EntityKind, status: &'static str },
}

/// A status enum that can be driven by a transition table.
pub trait LifecycleStatus:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn all() -> &'static [Self];
    fn as_str(&self) -> &'static str;

    /// Statuses computed from other fields, never valid as a requested target.
    fn is_derived(&self) -> bool {
        false
    }
}

impl LifecycleStatus for QuoteStatus {
    const KIND: EntityKind = EntityKind::Quote;

    fn all() -> &'static [Self] {
        &QuoteStatus::ALL
    }

    fn as_str(&self) -> &'static str {
        QuoteStatus::as_str(self)
    }
}

impl LifecycleStatus for JobStatus {
    const KIND: EntityKind = EntityKind::Job;

    fn all() -> &'static [Self] {
        &JobStatus::ALL
    }

    fn as_str(&self) -> &'static str {
        JobStatus::as_str(self)
    }
}

impl LifecycleStatus for InvoiceStatus {
    const KIND: EntityKind = EntityKind::Invoice;

    fn all() -> &'static [Self] {
        &InvoiceStatus::ALL
    }

    fn as_str(&self) -> &'static str {
        InvoiceStatus::as_str(self)
    }

    fn is_derived(&self) -> bool {
        *self == InvoiceStatus::Overdue
    }
}

/// Immutable map from every status of `S` to its exit rule.
#[derive(Debug, Clone)]
pub struct TransitionTable<S: LifecycleStatus> {
    rules: HashMap<S, Exit<S>>,
}

impl<S: LifecycleStatus> TransitionTable<S> {
    /// Build a table, rejecting missing or duplicate rules, self edges and empty target sets.
    pub fn build(rules: Vec<(S, Exit<S>)>) -> Result<Self, TableError> {
        let kind = S::KIND;
        let mut table = HashMap::with_capacity(rules.len());

        for (status, exit) in rules {
            if let Exit::To(targets) = exit {
                if targets.is_empty() {
                    return Err(TableError::EmptyTargets {
                        kind,
                        status: status.as_str(),
                    });
                }
                if targets.contains(&status) {
                    return Err(TableError::SelfTransition {
                        kind,
                        status: status.as_str(),
                    });
                }
            }
            if table.insert(status, exit).is_some() {
                return Err(TableError::DuplicateRule {
                    kind,
                    status: status.as_str(),
                });
            }
        }

        if let Some(missing) = S::all().iter().find(|s| !table.contains_key(*s)) {
            return Err(TableError::MissingRule {
                kind,
                status: missing.as_str(),
            });
        }

        Ok(Self { rules: table })
    }

    pub fn exit(&self, from: S) -> Exit<S> {
        self.rules.get(&from).copied().unwrap_or(Exit::Terminal)
    }

    pub fn targets(&self, from: S) -> &'static [S] {
        match self.exit(from) {
            Exit::To(targets) => targets,
            Exit::Conversion | Exit::Terminal => &[],
        }
    }

    pub fn allows(&self, from: S, to: S) -> bool {
        self.targets(from).contains(&to)
    }
}

pub fn quote_table() -> Result<TransitionTable<QuoteStatus>, TableError> {
    use QuoteStatus::*;
    TransitionTable::build(vec![
        (Draft, Exit::To(&[Sent])),
        (Sent, Exit::To(&[Viewed, Accepted, Declined, Expired])),
        (Viewed, Exit::To(&[Accepted, Declined, Expired])),
        (Accepted, Exit::Conversion),
        (Declined, Exit::Terminal),
        (Expired, Exit::Terminal),
    ])
}

pub fn job_table() -> Result<TransitionTable<JobStatus>, TableError> {
    use JobStatus::*;
    TransitionTable::build(vec![
        (Pending, Exit::To(&[Scheduled, Cancelled])),
        (Scheduled, Exit::To(&[InProgress, Cancelled])),
        (InProgress, Exit::To(&[OnHold, Completed, Cancelled])),
        (OnHold, Exit::To(&[InProgress, Cancelled])),
        (Completed, Exit::To(&[Invoiced])),
        (Invoiced, Exit::Terminal),
        (Cancelled, Exit::Terminal),
    ])
}

pub fn invoice_table() -> Result<TransitionTable<InvoiceStatus>, TableError> {
    use InvoiceStatus::*;
    TransitionTable::build(vec![
        (Draft, Exit::To(&[Sent, Cancelled])),
        (Sent, Exit::To(&[Viewed, Paid, Cancelled])),
        (Viewed, Exit::To(&[Paid, Cancelled])),
        (Overdue, Exit::To(&[Paid, Cancelled])),
        (Paid, Exit::Terminal),
        (Cancelled, Exit::Terminal),
    ])
}

/// A document whose status is governed by a transition table.
pub trait Transitionable: Sized {
    type Status: LifecycleStatus;

    fn entity(&self) -> EntityRef;
    fn org_id(&self) -> Uuid;

    /// Status that transitions are validated against. May be derived from the stored one.
    fn current_status(&self, today: NaiveDate) -> Self::Status;

    fn table(validator: &StatusTransitionValidator) -> &TransitionTable<Self::Status>;

    /// Preconditions for entering `target`, beyond table membership.
    fn guard(&self, _target: Self::Status, _at: DateTime<Utc>) -> Result<(), AppError> {
        Ok(())
    }

    /// Set the new status and its timestamps.
    fn enter(&mut self, target: Self::Status, at: DateTime<Utc>);
}

impl Transitionable for QuoteDetail {
    type Status = QuoteStatus;

    fn entity(&self) -> EntityRef {
        EntityRef::quote(self.quote.quote_id)
    }

    fn org_id(&self) -> Uuid {
        self.quote.org_id
    }

    fn current_status(&self, _today: NaiveDate) -> QuoteStatus {
        self.quote.status
    }

    fn table(validator: &StatusTransitionValidator) -> &TransitionTable<QuoteStatus> {
        &validator.quotes
    }

    fn guard(&self, target: QuoteStatus, at: DateTime<Utc>) -> Result<(), AppError> {
        match target {
            QuoteStatus::Sent => {
                require_sendable(self.quote.customer_email.as_deref(), self.line_items.len())
            }
            QuoteStatus::Accepted => match self.quote.valid_until {
                Some(valid_until) if valid_until < at.date_naive() => {
                    Err(AppError::BadRequest(anyhow::anyhow!(
                        "Quote expired on {} and can no longer be accepted",
                        valid_until
                    )))
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn enter(&mut self, target: QuoteStatus, at: DateTime<Utc>) {
        let quote = &mut self.quote;
        quote.status = target;
        quote.updated_utc = at;
        match target {
            QuoteStatus::Sent => quote.sent_utc = Some(at),
            QuoteStatus::Viewed => quote.viewed_utc = Some(at),
            QuoteStatus::Accepted => quote.accepted_utc = Some(at),
            QuoteStatus::Declined => quote.declined_utc = Some(at),
            QuoteStatus::Expired => quote.expired_utc = Some(at),
            QuoteStatus::Draft => {}
        }
    }
}

impl Transitionable for Job {
    type Status = JobStatus;

    fn entity(&self) -> EntityRef {
        EntityRef::job(self.job_id)
    }

    fn org_id(&self) -> Uuid {
        self.org_id
    }

    fn current_status(&self, _today: NaiveDate) -> JobStatus {
        self.status
    }

    fn table(validator: &StatusTransitionValidator) -> &TransitionTable<JobStatus> {
        &validator.jobs
    }

    fn enter(&mut self, target: JobStatus, at: DateTime<Utc>) {
        self.status = target;
        self.updated_utc = at;
        match target {
            JobStatus::InProgress => {
                self.started_utc.get_or_insert(at);
            }
            JobStatus::Completed => self.completed_utc = Some(at),
            JobStatus::Cancelled => self.cancelled_utc = Some(at),
            JobStatus::Invoiced => self.invoiced_utc = Some(at),
            JobStatus::Pending | JobStatus::Scheduled | JobStatus::OnHold => {}
        }
    }
}

impl Transitionable for InvoiceDetail {
    type Status = InvoiceStatus;

    fn entity(&self) -> EntityRef {
        EntityRef::invoice(self.invoice.invoice_id)
    }

    fn org_id(&self) -> Uuid {
        self.invoice.org_id
    }

    fn current_status(&self, today: NaiveDate) -> InvoiceStatus {
        self.invoice.effective_status(today)
    }

    fn table(validator: &StatusTransitionValidator) -> &TransitionTable<InvoiceStatus> {
        &validator.invoices
    }

    fn guard(&self, target: InvoiceStatus, _at: DateTime<Utc>) -> Result<(), AppError> {
        match target {
            InvoiceStatus::Sent => require_sendable(
                self.invoice.customer_email.as_deref(),
                self.line_items.len(),
            ),
            _ => Ok(()),
        }
    }

    fn enter(&mut self, target: InvoiceStatus, at: DateTime<Utc>) {
        enter_invoice(&mut self.invoice, target, at);
    }
}

fn enter_invoice(invoice: &mut Invoice, target: InvoiceStatus, at: DateTime<Utc>) {
    invoice.status = target;
    invoice.updated_utc = at;
    match target {
        InvoiceStatus::Sent => {
            invoice.sent_utc = Some(at);
            invoice.issue_date.get_or_insert(at.date_naive());
        }
        InvoiceStatus::Viewed => invoice.viewed_utc = Some(at),
        InvoiceStatus::Paid => {
            invoice.paid_utc = Some(at);
            // A manual mark settles whatever is still outstanding.
            if invoice.amount_due > Decimal::ZERO {
                invoice.amount_paid = invoice.total;
                invoice.amount_due = Decimal::ZERO;
            }
        }
        InvoiceStatus::Cancelled => invoice.cancelled_utc = Some(at),
        InvoiceStatus::Draft | InvoiceStatus::Overdue => {}
    }
}

fn require_sendable(customer_email: Option<&str>, line_items: usize) -> Result<(), AppError> {
    if customer_email.map(str::trim).filter(|e| !e.is_empty()).is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "A customer email is required before sending"
        )));
    }
    if line_items == 0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "At least one line item is required before sending"
        )));
    }
    Ok(())
}

/// Validates and applies status changes for every document kind.
#[derive(Debug, Clone)]
pub struct StatusTransitionValidator {
    quotes: TransitionTable<QuoteStatus>,
    jobs: TransitionTable<JobStatus>,
    invoices: TransitionTable<InvoiceStatus>,
}

impl StatusTransitionValidator {
    pub fn new(
        quotes: TransitionTable<QuoteStatus>,
        jobs: TransitionTable<JobStatus>,
        invoices: TransitionTable<InvoiceStatus>,
    ) -> Self {
        Self {
            quotes,
            jobs,
            invoices,
        }
    }

    /// Validator with the standard quote, job and invoice lifecycles.
    pub fn standard() -> Result<Self, TableError> {
        Ok(Self::new(quote_table()?, job_table()?, invoice_table()?))
    }

    /// Whether `target` is directly reachable from `current`. Unknown statuses are never reachable.
    pub fn can_transition(&self, kind: EntityKind, current: &str, target: &str) -> bool {
        match kind {
            EntityKind::Quote => allows_parsed(&self.quotes, current, target),
            EntityKind::Job => allows_parsed(&self.jobs, current, target),
            EntityKind::Invoice => allows_parsed(&self.invoices, current, target),
        }
    }

    /// Apply a status change, returning the updated document and its audit entry.
    ///
    /// The input is left untouched when the change is rejected.
    pub fn apply_transition<E: Transitionable + Clone>(
        &self,
        entity: &E,
        target: E::Status,
        actor: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(E, ActivityLogEntry), AppError> {
        let current = entity.current_status(at.date_naive());

        if target.is_derived() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "{} is derived and cannot be set directly",
                target
            )));
        }

        if !E::table(self).allows(current, target) {
            return Err(AppError::transition(current, target));
        }

        entity.guard(target, at)?;

        let mut updated = entity.clone();
        updated.enter(target, at);

        let entry = ActivityRecorder::status_change(
            updated.org_id(),
            updated.entity(),
            current.as_str(),
            target.as_str(),
            actor,
            at,
        );

        Ok((updated, entry))
    }
}

fn allows_parsed<S: LifecycleStatus>(table: &TransitionTable<S>, current: &str, target: &str) -> bool {
    match (S::from_str(current), S::from_str(target)) {
        (Ok(current), Ok(target)) => table.allows(current, target),
        _ => false,
    }
}
