//! Line item totals, tax and deposit calculation.
//!
//! Every document aggregate (creation, line item edits, conversion) goes through
//! [`compute_totals`] so the figures can never drift between code paths.

use crate::models::{Deposit, LineItem, NewLineItem};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use service_core::error::AppError;

/// Something with a quantity and a unit price.
pub trait Priced {
    fn quantity(&self) -> Decimal;
    fn unit_price(&self) -> Decimal;
    fn is_optional(&self) -> bool;

    fn line_total(&self) -> Result<Decimal, AppError> {
        line_total(self.quantity(), self.unit_price())
    }

    fn counts_toward_total(&self) -> bool {
        !self.is_optional()
    }
}

impl Priced for LineItem {
    fn quantity(&self) -> Decimal {
        self.quantity
    }

    fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    fn is_optional(&self) -> bool {
        self.is_optional
    }
}

impl Priced for NewLineItem {
    fn quantity(&self) -> Decimal {
        self.quantity
    }

    fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    fn is_optional(&self) -> bool {
        self.is_optional
    }
}

/// Aggregate money fields of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub deposit_amount: Decimal,
}

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Exclusive bound on any stored amount; money columns hold 15 integer digits.
fn amount_limit() -> Decimal {
    Decimal::from(1_000_000_000_000_000_i64)
}

fn out_of_range(what: &str) -> AppError {
    AppError::BadRequest(anyhow::anyhow!("{} exceeds the supported amount range", what))
}

/// Pass `value` through if its magnitude fits a money column.
pub fn check_amount(what: &str, value: Decimal) -> Result<Decimal, AppError> {
    if value.abs() < amount_limit() {
        Ok(value)
    } else {
        Err(out_of_range(what))
    }
}

pub fn line_total(quantity: Decimal, unit_price: Decimal) -> Result<Decimal, AppError> {
    let product = quantity
        .checked_mul(unit_price)
        .ok_or_else(|| out_of_range("Line total"))?;
    check_amount("Line total", round_money(product))
}

fn percent_of(amount: Decimal, percent: Decimal, what: &str) -> Result<Decimal, AppError> {
    let scaled = amount
        .checked_mul(percent)
        .ok_or_else(|| out_of_range(what))?;
    check_amount(what, round_money(scaled / Decimal::ONE_HUNDRED))
}

/// Compute subtotal, tax, total and deposit for the items that count toward the total.
///
/// Fails with a bad request when any figure leaves the storable range.
pub fn compute_totals<I: Priced>(
    items: &[I],
    tax_rate_percent: Decimal,
    deposit: &Deposit,
) -> Result<Totals, AppError> {
    let mut sum = Decimal::ZERO;
    for item in items.iter().filter(|item| item.counts_toward_total()) {
        sum = sum
            .checked_add(item.line_total()?)
            .ok_or_else(|| out_of_range("Subtotal"))?;
    }
    let subtotal = check_amount("Subtotal", round_money(sum))?;
    let tax = percent_of(subtotal, tax_rate_percent, "Tax")?;
    let total = check_amount(
        "Total",
        subtotal.checked_add(tax).ok_or_else(|| out_of_range("Total"))?,
    )?;

    let deposit_amount = match deposit {
        Deposit::None => Decimal::ZERO,
        Deposit::Fixed(value) => check_amount("Deposit", round_money(*value))?,
        Deposit::Percentage(percent) => percent_of(total, *percent, "Deposit")?,
    };

    Ok(Totals {
        subtotal,
        tax,
        total,
        deposit_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineItemType;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn item(quantity: &str, unit_price: &str, is_optional: bool) -> NewLineItem {
        NewLineItem {
            item_type: LineItemType::Service,
            description: "Work".to_string(),
            quantity: dec(quantity),
            unit: None,
            unit_price: dec(unit_price),
            is_optional,
            position: None,
        }
    }

    #[test]
    fn ten_percent_tax_and_half_deposit() {
        let items = vec![item("4", "250.00", false)];
        let totals = compute_totals(&items, dec("10"), &Deposit::Percentage(dec("50"))).unwrap();

        assert_eq!(totals.subtotal, dec("1000.00"));
        assert_eq!(totals.tax, dec("100.00"));
        assert_eq!(totals.total, dec("1100.00"));
        assert_eq!(totals.deposit_amount, dec("550.00"));
    }

    #[test]
    fn optional_items_are_excluded() {
        let items = vec![item("1", "100", false), item("2", "75", true)];
        let totals = compute_totals(&items, Decimal::ZERO, &Deposit::None).unwrap();

        assert_eq!(totals.subtotal, dec("100"));
        assert_eq!(totals.total, totals.subtotal + totals.tax);
        assert_eq!(totals.deposit_amount, Decimal::ZERO);
    }

    #[test]
    fn amounts_round_half_away_from_zero() {
        assert_eq!(round_money(dec("0.125")), dec("0.13"));
        assert_eq!(round_money(dec("-0.125")), dec("-0.13"));
        assert_eq!(line_total(dec("3"), dec("0.335")).unwrap(), dec("1.01"));

        let items = vec![item("1", "10.05", false)];
        let totals = compute_totals(&items, dec("7.5"), &Deposit::Fixed(dec("5"))).unwrap();
        // 10.05 * 7.5% = 0.75375
        assert_eq!(totals.tax, dec("0.75"));
        assert_eq!(totals.total, dec("10.80"));
        assert_eq!(totals.deposit_amount, dec("5"));
    }

    #[test]
    fn empty_document_totals_zero() {
        let items: Vec<NewLineItem> = Vec::new();
        assert_eq!(
            compute_totals(&items, dec("10"), &Deposit::Percentage(dec("50"))).unwrap(),
            Totals {
                subtotal: Decimal::ZERO,
                tax: Decimal::ZERO,
                total: Decimal::ZERO,
                deposit_amount: Decimal::ZERO,
            }
        );
    }

    #[test]
    fn oversized_line_product_is_a_bad_request() {
        let items = vec![item("1000000000000000", "1000000000000000", false)];
        let err = compute_totals(&items, dec("10"), &Deposit::None).unwrap_err();

        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(err.to_string().contains("Line total"));
    }

    #[test]
    fn subtotal_past_the_column_range_is_rejected() {
        // Each line fits; their sum does not.
        let items = vec![
            item("1", "600000000000000", false),
            item("1", "600000000000000", false),
        ];
        let err = compute_totals(&items, Decimal::ZERO, &Deposit::None).unwrap_err();
        assert!(err.to_string().contains("Subtotal"));

        let near_limit = vec![item("1", "999999999999999", false)];
        let err = compute_totals(&near_limit, dec("10"), &Deposit::None).unwrap_err();
        assert!(err.to_string().contains("Tax") || err.to_string().contains("Total"));
    }

    #[test]
    fn largest_storable_amount_is_accepted() {
        let items = vec![item("1", "999999999999999.99", false)];
        let totals = compute_totals(&items, Decimal::ZERO, &Deposit::None).unwrap();
        assert_eq!(totals.total, dec("999999999999999.99"));
        assert!(check_amount("Amount", dec("-1000000000000000")).is_err());
    }
}
