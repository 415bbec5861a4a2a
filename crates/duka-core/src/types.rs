//! # Domain Types
//!
//! Types shared by the device ledger, the remote ledger and the engine.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  DEVICE (owned exclusively by this till)                                │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SaleRecord    │──►│   SalePayload   │──►│ LineItem        │       │
//! │  │  id (stable)    │   │  sale_number    │   │ PaymentLeg      │       │
//! │  │  sync_state     │   │  items, total   │   └─────────────────┘       │
//! │  │  attempts       │   │  payments       │                              │
//! │  └─────────────────┘   └─────────────────┘                              │
//! │                                                                         │
//! │  REMOTE (single source of truth)                                        │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ StockMovement   │   │ AccountTrans-   │   │ CustomerAggre-  │       │
//! │  │ append-only     │   │ action          │   │ gate            │       │
//! │  │ prev ± qty = new│   │ reversed once   │   │ never negative  │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │  RemoteSale / RemoteSaleItem / ProductVariant / FinanceAccount          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Sync State
// =============================================================================

/// Where a queued sale is in its sync lifecycle.
///
/// ```text
/// Pending ──attempt──► Syncing ──ok──► Synced (removed, or kept as history)
///    ▲                    │
///    └──fail, attempts<max┘──fail, attempts>=max──► Failed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SyncState {
    #[default]
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncState {
    /// True for every state except `Synced`.
    pub fn is_unsynced(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Pending => write!(f, "pending"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Failed => write!(f, "failed"),
        }
    }
}

/// How a failed commit is treated by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FailureClass {
    /// Stock conflict, timeout, network. Retried quietly.
    Transient,
    /// Validation or schema rejection. Logged loudly from the first attempt.
    Fatal,
}

// =============================================================================
// Sale Payload (what the till captured)
// =============================================================================

/// One line on the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct LineItem {
    pub id: String,
    pub product_id: String,
    /// Stock-tracked variant. Service lines have none.
    #[serde(default)]
    pub variant_id: Option<String>,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub line_total: Money,
}

/// A single tender applied to the sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PaymentLeg {
    /// Finance account credited by this leg (cash drawer, M-Pesa till, bank).
    pub account_id: String,
    pub method: String,
    pub amount: Money,
}

/// The full domain sale as captured at the till.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SalePayload {
    pub sale_number: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub items: Vec<LineItem>,
    pub subtotal: Money,
    #[serde(default)]
    pub tax: Money,
    #[serde(default)]
    pub discount: Money,
    pub total: Money,
    #[serde(default)]
    pub payments: Vec<PaymentLeg>,
    pub sold_by: String,
    #[ts(as = "String")]
    pub sold_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SalePayload {
    /// Sum of all payment legs.
    pub fn amount_paid(&self) -> Money {
        self.payments.iter().map(|p| p.amount).sum()
    }

    /// Total quantity across all line items.
    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|i| i.quantity).sum()
    }
}

// =============================================================================
// Sale Record (device ledger entry)
// =============================================================================

/// A queued sale in the device ledger.
///
/// `id` is generated on the device and never changes, so every retry of
/// the same sale reaches the remote processor under the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SaleRecord {
    pub id: String,
    pub payload: SalePayload,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_state: SyncState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_logged: bool,
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure_class: Option<FailureClass>,
}

impl SaleRecord {
    /// Creates a fresh `Pending` record.
    pub fn new(id: impl Into<String>, payload: SalePayload, created_at: DateTime<Utc>) -> Self {
        SaleRecord {
            id: id.into(),
            payload,
            created_at,
            sync_state: SyncState::Pending,
            attempts: 0,
            last_error: None,
            error_logged: false,
            last_attempt_at: None,
            failure_class: None,
        }
    }

    /// `Pending` with attempts left.
    pub fn is_retry_eligible(&self, max_attempts: u32) -> bool {
        self.sync_state == SyncState::Pending && self.attempts < max_attempts
    }

    /// Not synced and out of attempts.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.sync_state.is_unsynced() && self.attempts >= max_attempts
    }
}

// =============================================================================
// Remote Ledger Types
// =============================================================================

/// Direction of a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    In,
    Out,
}

impl std::fmt::Display for MovementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementType::In => write!(f, "in"),
            MovementType::Out => write!(f, "out"),
        }
    }
}

/// A row of the append-only stock movement ledger.
///
/// ## Invariant
/// `new_quantity == previous_quantity + quantity` for `In`,
/// `new_quantity == previous_quantity - quantity` for `Out`.
/// Rows are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct StockMovement {
    /// Insertion order, breaks `created_at` ties.
    pub seq: i64,
    pub id: String,
    pub variant_id: String,
    pub product_id: String,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    /// Free text, e.g. "Sale S-0042 (3f2a9c1e)".
    pub reference: Option<String>,
    /// Sale id that caused the movement. Preferred lookup key.
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StockMovement {
    /// Checks the quantity arithmetic of this row.
    pub fn is_consistent(&self) -> bool {
        match self.movement_type {
            MovementType::In => self.new_quantity == self.previous_quantity + self.quantity,
            MovementType::Out => self.new_quantity == self.previous_quantity - self.quantity,
        }
    }
}

/// A movement about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStockMovement {
    pub variant_id: String,
    pub product_id: String,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub reference: Option<String>,
    pub reference_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewStockMovement {
    /// Builds an `Out` movement for `quantity` units leaving `previous`.
    pub fn outbound(
        variant_id: impl Into<String>,
        product_id: impl Into<String>,
        previous: i64,
        quantity: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        NewStockMovement {
            variant_id: variant_id.into(),
            product_id: product_id.into(),
            movement_type: MovementType::Out,
            quantity,
            previous_quantity: previous,
            new_quantity: previous - quantity,
            reference: None,
            reference_id: None,
            notes: None,
            created_at,
        }
    }

    /// Builds an `In` movement taking stock from `previous` to `target`.
    pub fn inbound_to(
        variant_id: impl Into<String>,
        product_id: impl Into<String>,
        previous: i64,
        target: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        NewStockMovement {
            variant_id: variant_id.into(),
            product_id: product_id.into(),
            movement_type: MovementType::In,
            quantity: target - previous,
            previous_quantity: previous,
            new_quantity: target,
            reference: None,
            reference_id: None,
            notes: None,
            created_at,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_reference_id(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Same arithmetic check as [`StockMovement::is_consistent`], plus a
    /// positive quantity.
    pub fn is_consistent(&self) -> bool {
        if self.quantity <= 0 {
            return false;
        }
        match self.movement_type {
            MovementType::In => self.new_quantity == self.previous_quantity + self.quantity,
            MovementType::Out => self.new_quantity == self.previous_quantity - self.quantity,
        }
    }
}

/// Stock-tracked product variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProductVariant {
    pub id: String,
    pub product_id: String,
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub updated_at: DateTime<Utc>,
}

/// Status of a committed sale on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum SaleStatus {
    #[default]
    Completed,
    /// Claimed by a reversal that has not finished yet.
    Reversing,
    Reversed,
}

/// Payment status of a committed sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Completed,
    Cancelled,
}

/// A sale as stored by the remote processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RemoteSale {
    pub id: String,
    pub sale_number: String,
    pub customer_id: Option<String>,
    pub total: i64,
    pub status: SaleStatus,
    pub payment_status: PaymentStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteSale {
    pub fn total(&self) -> Money {
        Money::new(self.total)
    }

    pub fn is_reversed(&self) -> bool {
        self.status == SaleStatus::Reversed
    }

    pub fn is_reversing(&self) -> bool {
        self.status == SaleStatus::Reversing
    }
}

/// A line item of a committed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RemoteSaleItem {
    pub id: String,
    pub sale_id: String,
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: i64,
    pub unit_price: i64,
    pub line_total: i64,
}

/// A finance account credited by payment legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FinanceAccount {
    pub id: String,
    pub name: String,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

impl FinanceAccount {
    pub fn balance(&self) -> Money {
        Money::new(self.balance)
    }
}

/// Reversal bookkeeping kept on each transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default)]
    pub sale_id: Option<String>,
    #[serde(default)]
    pub reversed: bool,
    #[serde(default)]
    pub reversed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reversed_by: Option<String>,
    #[serde(default)]
    pub reversal_reason: Option<String>,
}

/// A payment booked against a finance account.
///
/// Reversed at most once; the flag lives on the transaction, not the sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountTransaction {
    pub id: String,
    pub account_id: String,
    pub amount: Money,
    pub transaction_type: String,
    pub reference_sale_id: Option<String>,
    pub reference_number: Option<String>,
    pub metadata: TransactionMetadata,
    pub created_at: DateTime<Utc>,
}

impl AccountTransaction {
    pub fn is_reversed(&self) -> bool {
        self.metadata.reversed
    }
}

/// Transaction type written for every payment leg of a committed sale.
pub const PAYMENT_RECEIVED: &str = "payment_received";

/// Spend and loyalty aggregate of one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CustomerAggregate {
    pub id: String,
    pub name: String,
    pub total_spent: i64,
    pub loyalty_points: i64,
    pub updated_at: DateTime<Utc>,
}

impl CustomerAggregate {
    pub fn total_spent(&self) -> Money {
        Money::new(self.total_spent)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> SalePayload {
        SalePayload {
            sale_number: "S-0001".into(),
            customer_id: None,
            items: vec![LineItem {
                id: "li-1".into(),
                product_id: "p-1".into(),
                variant_id: Some("v-1".into()),
                sku: "RICE-5KG".into(),
                name: "Rice 5kg".into(),
                quantity: 2,
                unit_price: Money::new(7_500),
                line_total: Money::new(15_000),
            }],
            subtotal: Money::new(15_000),
            tax: Money::zero(),
            discount: Money::zero(),
            total: Money::new(15_000),
            payments: vec![PaymentLeg {
                account_id: "acc-cash".into(),
                method: "cash".into(),
                amount: Money::new(15_000),
            }],
            sold_by: "cashier-1".into(),
            sold_at: Utc::now(),
            notes: None,
        }
    }

    #[test]
    fn test_sale_record_json_uses_camel_case() {
        let record = SaleRecord::new("sale-1", payload(), Utc::now());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"syncState\":\"pending\""));
        assert!(json.contains("\"errorLogged\":false"));
        assert!(json.contains("\"saleNumber\":\"S-0001\""));
    }

    #[test]
    fn test_old_records_without_new_fields_still_load() {
        let record = SaleRecord::new("sale-1", payload(), Utc::now());
        let mut value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("lastAttemptAt");
        obj.remove("failureClass");
        obj.remove("errorLogged");

        let loaded: SaleRecord = serde_json::from_value(value).unwrap();
        assert_eq!(loaded.last_attempt_at, None);
        assert_eq!(loaded.failure_class, None);
        assert!(!loaded.error_logged);
    }

    #[test]
    fn test_retry_eligibility() {
        let mut record = SaleRecord::new("sale-1", payload(), Utc::now());
        assert!(record.is_retry_eligible(3));

        record.attempts = 3;
        assert!(!record.is_retry_eligible(3));
        assert!(record.is_exhausted(3));

        record.sync_state = SyncState::Synced;
        assert!(!record.is_exhausted(3));
    }

    #[test]
    fn test_movement_builders_keep_arithmetic() {
        let now = Utc::now();
        let out = NewStockMovement::outbound("v-1", "p-1", 10, 3, now);
        assert_eq!(out.new_quantity, 7);
        assert!(out.is_consistent());

        let restore = NewStockMovement::inbound_to("v-1", "p-1", 4, 10, now);
        assert_eq!(restore.quantity, 6);
        assert!(restore.is_consistent());

        let nothing = NewStockMovement::inbound_to("v-1", "p-1", 10, 10, now);
        assert!(!nothing.is_consistent());
    }

    #[test]
    fn test_payload_helpers() {
        let p = payload();
        assert_eq!(p.amount_paid(), Money::new(15_000));
        assert_eq!(p.total_quantity(), 2);
    }
}
