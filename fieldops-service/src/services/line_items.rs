//! Line item editing for draft quotes and invoices.
//!
//! An edit is an explicit command list. Removals apply first, then updates,
//! then additions; positions are renumbered from 1 and the document totals
//! are recomputed. The item set and the new aggregates are written together.

use super::activity::ActivityRecorder;
use super::store::{Expected, Store};
use super::totals::{check_amount, compute_totals, line_total};
use crate::models::{
    Deposit, DocumentRef, InvoiceDetail, InvoiceStatus, LineItem, LineItemChange, LineItemPatch,
    NewLineItem, QuoteDetail, QuoteStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Result of applying a command list to a document's items.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub items: Vec<LineItem>,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

fn invalid(message: String) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(message))
}

fn check_amounts(quantity: Decimal, unit_price: Decimal) -> Result<(), AppError> {
    if quantity <= Decimal::ZERO {
        return Err(invalid(format!("Quantity must be positive, got {}", quantity)));
    }
    if unit_price < Decimal::ZERO {
        return Err(invalid(format!("Unit price cannot be negative, got {}", unit_price)));
    }
    check_amount("Quantity", quantity)?;
    check_amount("Unit price", unit_price)?;
    Ok(())
}

fn check_optional(document: DocumentRef, is_optional: bool) -> Result<(), AppError> {
    if is_optional && matches!(document, DocumentRef::Invoice(_)) {
        return Err(invalid("Invoices cannot carry optional line items".to_string()));
    }
    Ok(())
}

/// Validate a new item against the document it is added to.
pub fn validate_new_item(document: DocumentRef, item: &NewLineItem) -> Result<(), AppError> {
    if item.description.trim().is_empty() {
        return Err(invalid("Line item description is required".to_string()));
    }
    check_amounts(item.quantity, item.unit_price)?;
    check_optional(document, item.is_optional)
}

fn materialize(
    org_id: Uuid,
    document: DocumentRef,
    item: &NewLineItem,
    at: DateTime<Utc>,
) -> Result<LineItem, AppError> {
    Ok(LineItem {
        line_item_id: Uuid::new_v4(),
        org_id,
        document,
        position: 0,
        item_type: item.item_type,
        description: item.description.trim().to_string(),
        quantity: item.quantity,
        unit: item.unit.clone(),
        unit_price: item.unit_price,
        line_total: line_total(item.quantity, item.unit_price)?,
        is_optional: item.is_optional,
        created_utc: at,
        updated_utc: at,
    })
}

fn apply_patch(item: &mut LineItem, patch: &LineItemPatch, at: DateTime<Utc>) -> Result<(), AppError> {
    if let Some(item_type) = patch.item_type {
        item.item_type = item_type;
    }
    if let Some(description) = &patch.description {
        if description.trim().is_empty() {
            return Err(invalid("Line item description is required".to_string()));
        }
        item.description = description.trim().to_string();
    }
    if let Some(quantity) = patch.quantity {
        item.quantity = quantity;
    }
    if let Some(unit) = &patch.unit {
        item.unit = Some(unit.clone());
    }
    if let Some(unit_price) = patch.unit_price {
        item.unit_price = unit_price;
    }
    if let Some(is_optional) = patch.is_optional {
        item.is_optional = is_optional;
    }
    check_amounts(item.quantity, item.unit_price)?;
    check_optional(item.document, item.is_optional)?;
    item.line_total = line_total(item.quantity, item.unit_price)?;
    item.updated_utc = at;
    Ok(())
}

/// Slot an item asked for. Explicit requests win ties against items keeping their place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Placement {
    slot: i32,
    kept: bool,
    sequence: usize,
}

/// Build the items of a new document, in request order unless positions are given.
pub fn build_items(
    org_id: Uuid,
    document: DocumentRef,
    items: &[NewLineItem],
    at: DateTime<Utc>,
) -> Result<Vec<LineItem>, AppError> {
    let mut placed = Vec::with_capacity(items.len());
    for (sequence, item) in items.iter().enumerate() {
        validate_new_item(document, item)?;
        let placement = Placement {
            slot: item.position.unwrap_or(i32::MAX),
            kept: item.position.is_none(),
            sequence,
        };
        placed.push((placement, materialize(org_id, document, item, at)?));
    }
    Ok(renumber(placed))
}

fn renumber(mut placed: Vec<(Placement, LineItem)>) -> Vec<LineItem> {
    placed.sort_by_key(|(placement, _)| *placement);
    placed
        .into_iter()
        .zip(1..)
        .map(|((_, mut item), position)| {
            item.position = position;
            item
        })
        .collect()
}

/// Apply a command list to the current items of `document`.
pub fn apply_changes(
    org_id: Uuid,
    document: DocumentRef,
    existing: &[LineItem],
    changes: &[LineItemChange],
    at: DateTime<Utc>,
) -> Result<EditOutcome, AppError> {
    let mut working: HashMap<Uuid, LineItem> = existing
        .iter()
        .map(|item| (item.line_item_id, item.clone()))
        .collect();
    let mut removed_ids = HashSet::new();

    for change in changes {
        if let LineItemChange::Remove { line_item_id } = change {
            if working.remove(line_item_id).is_none() {
                return Err(unknown_or_removed(*line_item_id, &removed_ids));
            }
            removed_ids.insert(*line_item_id);
        }
    }

    let mut requested_slots = HashMap::new();
    let mut updated_ids = HashSet::new();
    for change in changes {
        if let LineItemChange::Update {
            line_item_id,
            patch,
        } = change
        {
            let Some(item) = working.get_mut(line_item_id) else {
                return Err(unknown_or_removed(*line_item_id, &removed_ids));
            };
            apply_patch(item, patch, at)?;
            if let Some(position) = patch.position {
                requested_slots.insert(*line_item_id, position);
            }
            updated_ids.insert(*line_item_id);
        }
    }

    let mut placed: Vec<(Placement, LineItem)> = Vec::with_capacity(working.len());
    let mut kept: Vec<LineItem> = working.into_values().collect();
    kept.sort_by_key(|item| item.position);
    for (sequence, item) in kept.into_iter().enumerate() {
        let placement = match requested_slots.get(&item.line_item_id) {
            Some(slot) => Placement {
                slot: *slot,
                kept: false,
                sequence,
            },
            None => Placement {
                slot: item.position,
                kept: true,
                sequence,
            },
        };
        placed.push((placement, item));
    }

    let mut added = 0;
    let offset = placed.len();
    for change in changes {
        if let LineItemChange::Add { item } = change {
            validate_new_item(document, item)?;
            let placement = Placement {
                slot: item.position.unwrap_or(i32::MAX),
                kept: item.position.is_none(),
                sequence: offset + added,
            };
            placed.push((placement, materialize(org_id, document, item, at)?));
            added += 1;
        }
    }

    Ok(EditOutcome {
        items: renumber(placed),
        added,
        updated: updated_ids.len(),
        removed: removed_ids.len(),
    })
}

fn unknown_or_removed(line_item_id: Uuid, removed: &HashSet<Uuid>) -> AppError {
    if removed.contains(&line_item_id) {
        invalid(format!("Line item {} is removed in this edit", line_item_id))
    } else {
        invalid(format!("Unknown line item {}", line_item_id))
    }
}

/// Applies line item edits to draft documents.
#[derive(Clone)]
pub struct LineItemEditor {
    store: Arc<dyn Store>,
}

impl LineItemEditor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn edit_quote_items(
        &self,
        org_id: Uuid,
        quote_id: Uuid,
        changes: &[LineItemChange],
        actor_id: Option<Uuid>,
    ) -> Result<QuoteDetail, AppError> {
        let detail = self
            .store
            .get_quote(org_id, quote_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Quote not found")))?;
        require_draft("Quote", detail.quote.status == QuoteStatus::Draft, detail.quote.status)?;

        let at = Utc::now();
        let document = DocumentRef::Quote(quote_id);
        let outcome = apply_changes(org_id, document, &detail.line_items, changes, at)?;
        let totals = compute_totals(&outcome.items, detail.quote.tax_rate, &detail.quote.deposit)?;
        let expected = Expected::quote(&detail.quote);

        let mut quote = detail.quote;
        quote.subtotal = totals.subtotal;
        quote.tax_total = totals.tax;
        quote.total = totals.total;
        quote.deposit_amount = totals.deposit_amount;
        quote.updated_utc = at;

        let entry = ActivityRecorder::line_items_changed(
            org_id,
            document.entity(),
            outcome.added,
            outcome.updated,
            outcome.removed,
            actor_id,
            at,
        );

        let written = self
            .store
            .update_quote(&quote, expected, Some(&outcome.items), &[entry])
            .await?;
        if !written {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Quote changed during the edit; reload and retry"
            )));
        }

        tracing::info!(
            quote_id = %quote_id,
            items = outcome.items.len(),
            total = %quote.total,
            "Quote line items updated"
        );

        Ok(QuoteDetail {
            quote,
            line_items: outcome.items,
        })
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn edit_invoice_items(
        &self,
        org_id: Uuid,
        invoice_id: Uuid,
        changes: &[LineItemChange],
        actor_id: Option<Uuid>,
    ) -> Result<InvoiceDetail, AppError> {
        let detail = self
            .store
            .get_invoice(org_id, invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
        require_draft(
            "Invoice",
            detail.invoice.status == InvoiceStatus::Draft,
            detail.invoice.status,
        )?;

        let at = Utc::now();
        let document = DocumentRef::Invoice(invoice_id);
        let outcome = apply_changes(org_id, document, &detail.line_items, changes, at)?;
        let totals = compute_totals(&outcome.items, detail.invoice.tax_rate, &Deposit::None)?;
        let expected = Expected::invoice(&detail.invoice);

        let mut invoice = detail.invoice;
        invoice.subtotal = totals.subtotal;
        invoice.tax_total = totals.tax;
        invoice.total = totals.total;
        invoice.amount_due = (totals.total - invoice.amount_paid).max(Decimal::ZERO);
        invoice.updated_utc = at;

        let entry = ActivityRecorder::line_items_changed(
            org_id,
            document.entity(),
            outcome.added,
            outcome.updated,
            outcome.removed,
            actor_id,
            at,
        );

        let written = self
            .store
            .update_invoice(&invoice, expected, Some(&outcome.items), &[entry])
            .await?;
        if !written {
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Invoice changed during the edit; reload and retry"
            )));
        }

        tracing::info!(
            invoice_id = %invoice_id,
            items = outcome.items.len(),
            total = %invoice.total,
            "Invoice line items updated"
        );

        Ok(InvoiceDetail {
            invoice,
            line_items: outcome.items,
        })
    }
}

fn require_draft(kind: &str, is_draft: bool, status: impl std::fmt::Display) -> Result<(), AppError> {
    if is_draft {
        Ok(())
    } else {
        Err(AppError::InvalidState(anyhow::anyhow!(
            "{} is {}; only draft documents can be edited",
            kind,
            status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreateQuote, LineItemType};
    use crate::services::{DocumentService, MemoryStore};
    use serde_json::json;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn new_item(description: &str, quantity: &str, unit_price: &str) -> NewLineItem {
        NewLineItem {
            item_type: LineItemType::Material,
            description: description.to_string(),
            quantity: dec(quantity),
            unit: None,
            unit_price: dec(unit_price),
            is_optional: false,
            position: None,
        }
    }

    fn existing(document: DocumentRef) -> Vec<LineItem> {
        build_items(
            Uuid::new_v4(),
            document,
            &[
                new_item("Pipe", "2", "10"),
                new_item("Valve", "1", "45.50"),
                new_item("Labor", "3", "60"),
            ],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn built_items_are_numbered_in_order() {
        let items = existing(DocumentRef::Quote(Uuid::new_v4()));
        let positions: Vec<i32> = items.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(items[1].line_total, dec("45.50"));
    }

    #[test]
    fn removals_then_updates_then_adds() {
        let document = DocumentRef::Quote(Uuid::new_v4());
        let items = existing(document);
        let changes = vec![
            LineItemChange::Add {
                item: new_item("Sealant", "1", "5"),
            },
            LineItemChange::Update {
                line_item_id: items[2].line_item_id,
                patch: LineItemPatch {
                    quantity: Some(dec("4")),
                    ..Default::default()
                },
            },
            LineItemChange::Remove {
                line_item_id: items[0].line_item_id,
            },
        ];

        let outcome = apply_changes(Uuid::new_v4(), document, &items, &changes, Utc::now()).unwrap();
        let descriptions: Vec<&str> = outcome.items.iter().map(|i| i.description.as_str()).collect();

        assert_eq!(descriptions, vec!["Valve", "Labor", "Sealant"]);
        assert_eq!(outcome.items[1].line_total, dec("240"));
        assert_eq!(
            outcome.items.iter().map(|i| i.position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!((outcome.added, outcome.updated, outcome.removed), (1, 1, 1));
    }

    #[test]
    fn updating_a_removed_item_is_rejected() {
        let document = DocumentRef::Quote(Uuid::new_v4());
        let items = existing(document);
        let id = items[0].line_item_id;
        let changes = vec![
            LineItemChange::Remove { line_item_id: id },
            LineItemChange::Update {
                line_item_id: id,
                patch: LineItemPatch::default(),
            },
        ];

        let err = apply_changes(Uuid::new_v4(), document, &items, &changes, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("removed in this edit"));
    }

    #[test]
    fn unknown_items_and_bad_amounts_are_rejected() {
        let document = DocumentRef::Quote(Uuid::new_v4());
        let items = existing(document);

        let unknown = vec![LineItemChange::Remove {
            line_item_id: Uuid::new_v4(),
        }];
        assert!(apply_changes(Uuid::new_v4(), document, &items, &unknown, Utc::now()).is_err());

        let zero_quantity = vec![LineItemChange::Add {
            item: new_item("Nothing", "0", "10"),
        }];
        assert!(apply_changes(Uuid::new_v4(), document, &items, &zero_quantity, Utc::now()).is_err());

        let negative_price = vec![LineItemChange::Update {
            line_item_id: items[0].line_item_id,
            patch: LineItemPatch {
                unit_price: Some(dec("-1")),
                ..Default::default()
            },
        }];
        assert!(
            apply_changes(Uuid::new_v4(), document, &items, &negative_price, Utc::now()).is_err()
        );
    }

    #[test]
    fn invoices_reject_optional_items() {
        let document = DocumentRef::Invoice(Uuid::new_v4());
        let mut optional = new_item("Extra", "1", "10");
        optional.is_optional = true;

        assert!(build_items(Uuid::new_v4(), document, &[optional.clone()], Utc::now()).is_err());
        assert!(build_items(
            Uuid::new_v4(),
            DocumentRef::Quote(Uuid::new_v4()),
            &[optional],
            Utc::now()
        )
        .is_ok());
    }

    #[test]
    fn requested_position_moves_item() {
        let document = DocumentRef::Quote(Uuid::new_v4());
        let items = existing(document);
        let changes = vec![
            LineItemChange::Update {
                line_item_id: items[2].line_item_id,
                patch: LineItemPatch {
                    position: Some(1),
                    ..Default::default()
                },
            },
            LineItemChange::Add {
                item: NewLineItem {
                    position: Some(2),
                    ..new_item("Filter", "1", "12")
                },
            },
        ];

        let outcome = apply_changes(Uuid::new_v4(), document, &items, &changes, Utc::now()).unwrap();
        let descriptions: Vec<&str> = outcome.items.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Labor", "Pipe", "Filter", "Valve"]);
    }

    #[test]
    fn change_commands_deserialize_from_json() {
        let changes: Vec<LineItemChange> = serde_json::from_value(serde_json::json!([
            { "action": "add", "description": "Fan", "quantity": "1", "unit_price": "80.00" },
            { "action": "remove", "line_item_id": "7f1c5b1e-8c57-4a4e-9d3e-0e2f4c1a9b10" }
        ]))
        .unwrap();

        assert!(matches!(&changes[0], LineItemChange::Add { item } if item.description == "Fan"));
        assert!(matches!(changes[1], LineItemChange::Remove { .. }));
    }

    #[tokio::test]
    async fn edits_planned_from_the_same_read_do_not_both_land() {
        let store = Arc::new(MemoryStore::new());
        let documents = DocumentService::new(store.clone(), 14);
        let editor = LineItemEditor::new(store.clone());
        let org_id = Uuid::new_v4();
        let input: CreateQuote = serde_json::from_value(json!({
            "customer_id": Uuid::new_v4(),
            "customer_name": "Harbour Cafe",
            "title": "Kitchen rewiring",
            "line_items": [
                { "item_type": "material", "description": "Cable", "quantity": "1", "unit_price": "30" }
            ]
        }))
        .unwrap();
        let quote_id = documents
            .create_quote(org_id, input, None)
            .await
            .unwrap()
            .quote
            .quote_id;
        let read = store.get_quote(org_id, quote_id).await.unwrap().unwrap();

        editor
            .edit_quote_items(
                org_id,
                quote_id,
                &[LineItemChange::Add {
                    item: new_item("Sealant", "1", "5"),
                }],
                None,
            )
            .await
            .unwrap();

        let outcome = apply_changes(
            org_id,
            DocumentRef::Quote(quote_id),
            &read.line_items,
            &[LineItemChange::Add {
                item: new_item("Filter", "1", "12"),
            }],
            Utc::now(),
        )
        .unwrap();
        let mut late = read.quote.clone();
        late.updated_utc = Utc::now();
        let written = store
            .update_quote(&late, Expected::quote(&read.quote), Some(&outcome.items), &[])
            .await
            .unwrap();
        assert!(!written);

        let current = store.get_quote(org_id, quote_id).await.unwrap().unwrap();
        let descriptions: Vec<&str> = current.line_items.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Cable", "Sealant"]);
        assert_eq!(current.quote.total, dec("35"));
    }

    #[test]
    fn quantities_past_the_amount_range_are_rejected() {
        let document = DocumentRef::Quote(Uuid::new_v4());
        let err = validate_new_item(document, &new_item("Cable", "1000000000000000", "1")).unwrap_err();
        assert!(err.to_string().contains("Quantity exceeds"));

        let items = existing(document);
        let huge_price = vec![LineItemChange::Update {
            line_item_id: items[0].line_item_id,
            patch: LineItemPatch {
                unit_price: Some(dec("1000000000000000")),
                ..Default::default()
            },
        }];
        let err = apply_changes(Uuid::new_v4(), document, &items, &huge_price, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
