//! # Reversal Planning
//!
//! The pure half of undoing a committed sale. Nothing here reads or writes
//! a store; the engine in `duka-sync` fetches rows, asks this module what
//! to do, then applies the answer.
//!
//! ## Restore Baseline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Movement ledger for variant v-1                                        │
//! │                                                                         │
//! │    out  prev 10 ─► new 7    ref_id = sale-A    ◄── baseline found       │
//! │    out  prev  7 ─► new 4    ref_id = sale-B                             │
//! │                                                                         │
//! │  Reverse sale-A:                                                        │
//! │    target  = baseline.previous_quantity = 10                            │
//! │    current = 4                                                          │
//! │    write   in  prev 4 ─► new 10  qty 6                                  │
//! │                                                                         │
//! │  Without a baseline (degraded): target = current + sold = 4 + 3 = 7     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;
use crate::types::{
    AccountTransaction, CustomerAggregate, MovementType, NewStockMovement, RemoteSaleItem,
    StockMovement,
};
use crate::SALE_REFERENCE_PREFIX_LEN;

// =============================================================================
// Variant Grouping
// =============================================================================

/// Line items of one variant, summed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantGroup {
    pub variant_id: String,
    pub product_id: String,
    pub quantity: i64,
    pub item_count: usize,
}

/// Result of grouping a sale's items by variant.
#[derive(Debug, Clone, Default)]
pub struct VariantGrouping {
    /// Ordered by variant id.
    pub groups: Vec<VariantGroup>,
    /// Item ids without a variant (service lines).
    pub skipped: Vec<String>,
}

/// Groups items by `variant_id`, summing quantities.
///
/// Two lines of the same variant (qty 2 and qty 3) become one group of 5,
/// so the variant is restored once.
pub fn group_by_variant(items: &[RemoteSaleItem]) -> VariantGrouping {
    let mut by_variant: BTreeMap<&str, VariantGroup> = BTreeMap::new();
    let mut skipped = Vec::new();

    for item in items {
        let Some(variant_id) = item.variant_id.as_deref().filter(|v| !v.is_empty()) else {
            skipped.push(item.id.clone());
            continue;
        };

        let group = by_variant.entry(variant_id).or_insert_with(|| VariantGroup {
            variant_id: variant_id.to_string(),
            product_id: item.product_id.clone(),
            quantity: 0,
            item_count: 0,
        });
        group.quantity += item.quantity;
        group.item_count += 1;
    }

    VariantGrouping {
        groups: by_variant.into_values().collect(),
        skipped,
    }
}

// =============================================================================
// Movement Lookup
// =============================================================================

/// Strategies for finding the stock-out row a sale produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementLookup {
    /// `reference_id == sale_id`.
    ReferenceId,
    /// `reference` text contains the sale id or its short prefix.
    ReferenceText,
    /// Latest `out` row at or just before the sale time.
    Timestamp,
}

impl MovementLookup {
    /// Tried in this order, first hit wins.
    pub const ORDERED: [MovementLookup; 3] = [
        MovementLookup::ReferenceId,
        MovementLookup::ReferenceText,
        MovementLookup::Timestamp,
    ];
}

impl std::fmt::Display for MovementLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementLookup::ReferenceId => write!(f, "reference_id"),
            MovementLookup::ReferenceText => write!(f, "reference_text"),
            MovementLookup::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Substrings searched for in a movement's `reference` text.
///
/// Commits write "Sale <number> (<first 8 chars of id>)", so the short
/// prefix is tried after the full id.
pub fn sale_reference_needles(sale_id: &str) -> Vec<String> {
    let mut needles = vec![sale_id.to_string()];
    if let Some((cut, _)) = sale_id.char_indices().nth(SALE_REFERENCE_PREFIX_LEN) {
        needles.push(sale_id[..cut].to_string());
    }
    needles
}

/// Picks the latest `out` movement with `created_at <= sale_time + tolerance`.
///
/// Ties on `created_at` go to the row inserted last.
pub fn select_by_timestamp<'a>(
    movements: &'a [StockMovement],
    sale_time: DateTime<Utc>,
    tolerance: Duration,
) -> Option<&'a StockMovement> {
    let cutoff = sale_time + tolerance;
    movements
        .iter()
        .filter(|m| m.movement_type == MovementType::Out && m.created_at <= cutoff)
        .max_by_key(|m| (m.created_at, m.seq))
}

// =============================================================================
// Restore Plan
// =============================================================================

/// Where a restore target came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline {
    /// Historical `previous_quantity` of the sale's stock-out row.
    Movement {
        movement_id: String,
        strategy: MovementLookup,
    },
    /// No movement found: current + sold.
    Degraded,
}

/// What the engine will do to one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub variant_id: String,
    pub product_id: String,
    pub sold_quantity: i64,
    pub current_quantity: i64,
    pub target_quantity: i64,
    pub baseline: Baseline,
}

impl RestorePlan {
    /// Plan anchored on the historical stock-out row.
    pub fn from_movement(
        group: &VariantGroup,
        current_quantity: i64,
        movement: &StockMovement,
        strategy: MovementLookup,
    ) -> Self {
        RestorePlan {
            variant_id: group.variant_id.clone(),
            product_id: group.product_id.clone(),
            sold_quantity: group.quantity,
            current_quantity,
            target_quantity: movement.previous_quantity,
            baseline: Baseline::Movement {
                movement_id: movement.id.clone(),
                strategy,
            },
        }
    }

    /// Plan without a baseline row.
    pub fn degraded(group: &VariantGroup, current_quantity: i64) -> Self {
        RestorePlan {
            variant_id: group.variant_id.clone(),
            product_id: group.product_id.clone(),
            sold_quantity: group.quantity,
            current_quantity,
            target_quantity: current_quantity + group.quantity,
            baseline: Baseline::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.baseline, Baseline::Degraded)
    }

    /// Units the compensating row adds.
    pub fn delta(&self) -> i64 {
        self.target_quantity - self.current_quantity
    }

    /// The compensating `in` row, or `None` when stock is already at or
    /// above the target.
    pub fn compensating_movement(
        &self,
        sale_id: &str,
        reference: &str,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Option<NewStockMovement> {
        if self.delta() <= 0 {
            return None;
        }
        Some(
            NewStockMovement::inbound_to(
                &self.variant_id,
                &self.product_id,
                self.current_quantity,
                self.target_quantity,
                at,
            )
            .with_reference(reference)
            .with_reference_id(sale_id)
            .with_notes(notes),
        )
    }
}

// =============================================================================
// Payments
// =============================================================================

/// Net amounts to take back, per finance account.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountNetting {
    /// Account id to net amount, ordered by account id.
    pub per_account: BTreeMap<String, Money>,
    /// Transactions included in the netting.
    pub transaction_ids: Vec<String>,
}

impl AccountNetting {
    pub fn is_empty(&self) -> bool {
        self.transaction_ids.is_empty()
    }
}

/// Groups not-yet-reversed transactions by account.
///
/// Already reversed rows are left out, so a partially completed earlier
/// reversal is never applied twice to a balance.
pub fn net_by_account(transactions: &[AccountTransaction]) -> AccountNetting {
    let mut netting = AccountNetting::default();
    for tx in transactions.iter().filter(|tx| !tx.is_reversed()) {
        *netting
            .per_account
            .entry(tx.account_id.clone())
            .or_insert_with(Money::zero) += tx.amount;
        netting.transaction_ids.push(tx.id.clone());
    }
    netting
}

// =============================================================================
// Customer
// =============================================================================

/// Customer aggregate after taking one sale back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomerRollback {
    pub total_spent: Money,
    pub loyalty_points: i64,
}

/// Removes `sale_total` and its loyalty points, floored at zero.
pub fn rollback_customer(customer: &CustomerAggregate, sale_total: Money) -> CustomerRollback {
    CustomerRollback {
        total_spent: customer.total_spent().saturating_sub_floor(sale_total),
        loyalty_points: (customer.loyalty_points - sale_total.loyalty_points()).max(0),
    }
}

// =============================================================================
// Notes
// =============================================================================

/// Appends the reversal entry to whatever notes the sale already had.
pub fn reversal_note(existing: Option<&str>, at: DateTime<Utc>, by: &str, reason: &str) -> String {
    let entry = format!("[REVERSED] {} by {}: {}", at.to_rfc3339(), by, reason);
    match existing.map(str::trim).filter(|n| !n.is_empty()) {
        Some(notes) => format!("{}\n\n{}", notes, entry),
        None => entry,
    }
}

/// Notes written on each compensating stock row.
pub fn restore_movement_note(sale_number: &str, plan: &RestorePlan) -> String {
    match plan.baseline {
        Baseline::Movement { strategy, .. } => format!(
            "Reversal of sale {}: restored to {} (baseline via {})",
            sale_number, plan.target_quantity, strategy
        ),
        Baseline::Degraded => format!(
            "Reversal of sale {}: restored to {} (no baseline movement, current + sold)",
            sale_number, plan.target_quantity
        ),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionMetadata;

    fn item(id: &str, variant: Option<&str>, qty: i64) -> RemoteSaleItem {
        RemoteSaleItem {
            id: id.into(),
            sale_id: "sale-1".into(),
            product_id: "p-1".into(),
            variant_id: variant.map(String::from),
            quantity: qty,
            unit_price: 1_000,
            line_total: 1_000 * qty,
        }
    }

    fn movement(seq: i64, prev: i64, qty: i64, at: DateTime<Utc>) -> StockMovement {
        StockMovement {
            seq,
            id: format!("m-{}", seq),
            variant_id: "v-1".into(),
            product_id: "p-1".into(),
            movement_type: MovementType::Out,
            quantity: qty,
            previous_quantity: prev,
            new_quantity: prev - qty,
            reference: None,
            reference_id: None,
            notes: None,
            created_at: at,
        }
    }

    fn tx(id: &str, account: &str, amount: i64, reversed: bool) -> AccountTransaction {
        AccountTransaction {
            id: id.into(),
            account_id: account.into(),
            amount: Money::new(amount),
            transaction_type: crate::types::PAYMENT_RECEIVED.into(),
            reference_sale_id: Some("sale-1".into()),
            reference_number: None,
            metadata: TransactionMetadata {
                reversed,
                ..Default::default()
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_grouping_sums_same_variant() {
        let grouping = group_by_variant(&[
            item("i-1", Some("v-1"), 2),
            item("i-2", Some("v-2"), 1),
            item("i-3", Some("v-1"), 3),
            item("i-4", None, 1),
        ]);

        assert_eq!(grouping.groups.len(), 2);
        assert_eq!(grouping.groups[0].variant_id, "v-1");
        assert_eq!(grouping.groups[0].quantity, 5);
        assert_eq!(grouping.groups[0].item_count, 2);
        assert_eq!(grouping.skipped, vec!["i-4".to_string()]);
    }

    #[test]
    fn test_reference_needles() {
        let needles = sale_reference_needles("0b6f3c1e-7d2a-4a51");
        assert_eq!(needles, vec!["0b6f3c1e-7d2a-4a51".to_string(), "0b6f3c1e".to_string()]);

        assert_eq!(sale_reference_needles("short"), vec!["short".to_string()]);
    }

    #[test]
    fn test_timestamp_selection_respects_tolerance() {
        let sale_time = Utc::now();
        let movements = vec![
            movement(1, 20, 2, sale_time - Duration::minutes(30)),
            movement(2, 18, 3, sale_time + Duration::seconds(20)),
            movement(3, 15, 1, sale_time + Duration::minutes(10)),
        ];

        let hit = select_by_timestamp(&movements, sale_time, Duration::seconds(60)).unwrap();
        assert_eq!(hit.id, "m-2");

        let hit = select_by_timestamp(&movements, sale_time, Duration::zero()).unwrap();
        assert_eq!(hit.id, "m-1");

        assert!(select_by_timestamp(&movements, sale_time - Duration::hours(1), Duration::zero()).is_none());
    }

    #[test]
    fn test_timestamp_tie_goes_to_last_inserted() {
        let at = Utc::now();
        let movements = vec![movement(7, 10, 1, at), movement(8, 9, 1, at)];
        let hit = select_by_timestamp(&movements, at, Duration::zero()).unwrap();
        assert_eq!(hit.seq, 8);
    }

    #[test]
    fn test_restore_to_historical_baseline() {
        let group = VariantGroup {
            variant_id: "v-1".into(),
            product_id: "p-1".into(),
            quantity: 3,
            item_count: 1,
        };
        let sold = movement(1, 10, 3, Utc::now());

        // Stock fell further after the sale
        let plan = RestorePlan::from_movement(&group, 4, &sold, MovementLookup::ReferenceId);
        assert_eq!(plan.target_quantity, 10);
        assert_eq!(plan.delta(), 6);

        let row = plan
            .compensating_movement("sale-1", "Reversal S-1", "note", Utc::now())
            .unwrap();
        assert_eq!(row.movement_type, MovementType::In);
        assert_eq!(row.previous_quantity, 4);
        assert_eq!(row.new_quantity, 10);
        assert_eq!(row.quantity, 6);
        assert!(row.is_consistent());
    }

    #[test]
    fn test_degraded_plan() {
        let group = VariantGroup {
            variant_id: "v-1".into(),
            product_id: "p-1".into(),
            quantity: 3,
            item_count: 1,
        };
        let plan = RestorePlan::degraded(&group, 4);
        assert!(plan.is_degraded());
        assert_eq!(plan.target_quantity, 7);
    }

    #[test]
    fn test_no_movement_when_already_above_target() {
        let group = VariantGroup {
            variant_id: "v-1".into(),
            product_id: "p-1".into(),
            quantity: 3,
            item_count: 1,
        };
        let sold = movement(1, 10, 3, Utc::now());
        let plan = RestorePlan::from_movement(&group, 12, &sold, MovementLookup::Timestamp);
        assert!(plan.compensating_movement("sale-1", "r", "n", Utc::now()).is_none());
    }

    #[test]
    fn test_netting_skips_reversed() {
        let netting = net_by_account(&[
            tx("t-1", "acc-cash", 5_000, false),
            tx("t-2", "acc-cash", 2_000, false),
            tx("t-3", "acc-mpesa", 8_000, false),
            tx("t-4", "acc-mpesa", 9_999, true),
        ]);

        assert_eq!(netting.per_account.len(), 2);
        assert_eq!(netting.per_account["acc-cash"], Money::new(7_000));
        assert_eq!(netting.per_account["acc-mpesa"], Money::new(8_000));
        assert_eq!(netting.transaction_ids.len(), 3);
    }

    #[test]
    fn test_customer_rollback_floors_at_zero() {
        let customer = CustomerAggregate {
            id: "c-1".into(),
            name: "Amina".into(),
            total_spent: 10_000,
            loyalty_points: 4,
            updated_at: Utc::now(),
        };

        let rolled = rollback_customer(&customer, Money::new(15_000));
        assert_eq!(rolled.total_spent, Money::zero());
        assert_eq!(rolled.loyalty_points, 0);

        let rolled = rollback_customer(&customer, Money::new(3_000));
        assert_eq!(rolled.total_spent, Money::new(7_000));
        assert_eq!(rolled.loyalty_points, 1);
    }

    #[test]
    fn test_reversal_note_appends() {
        let at = Utc::now();
        let note = reversal_note(Some("Paid in two legs"), at, "manager-1", "Wrong items");
        assert!(note.starts_with("Paid in two legs\n\n[REVERSED] "));
        assert!(note.ends_with("by manager-1: Wrong items"));

        let fresh = reversal_note(None, at, "manager-1", "Wrong items");
        assert!(fresh.starts_with("[REVERSED] "));
    }
}
