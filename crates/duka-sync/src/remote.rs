//! # Remote Ledger Boundary
//!
//! Everything the engine needs from the remote system, as traits, plus the
//! SQLite adapter that implements all of them over `duka-db`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SyncScheduler ──► RemoteSaleProcessor::commit(sale_id, payload)        │
//! │                      idempotent on sale_id                              │
//! │                                                                         │
//! │  ReversalEngine ─┬► SaleStore       load sale + items, mark reversed    │
//! │                  ├► MovementLedger  lookups, append, direct write       │
//! │                  ├► FinanceStore    transactions, balances              │
//! │                  └► CustomerStore   spend / loyalty aggregate           │
//! │                                                                         │
//! │  SqliteRemoteLedger implements all five over one duka_db::Database      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CommitError, CommitErrorKind, SyncResult};
use duka_core::validation::validate_sale_id;
use duka_core::{
    AccountTransaction, CustomerAggregate, Money, NewStockMovement, RemoteSale, RemoteSaleItem,
    SalePayload, StockMovement,
};
use duka_db::{CommitOutcome, Database};

// =============================================================================
// Commit
// =============================================================================

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReceipt {
    /// The sale was new and has been applied.
    Applied { movements: usize, transactions: usize },
    /// The sale id was already committed; nothing changed.
    AlreadyCommitted,
}

impl CommitReceipt {
    pub fn is_new(&self) -> bool {
        matches!(self, CommitReceipt::Applied { .. })
    }
}

impl std::fmt::Display for CommitReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitReceipt::Applied { movements, transactions } => write!(
                f,
                "applied ({} movements, {} transactions)",
                movements, transactions
            ),
            CommitReceipt::AlreadyCommitted => write!(f, "already committed"),
        }
    }
}

impl From<CommitOutcome> for CommitReceipt {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Applied { movements, transactions } => {
                CommitReceipt::Applied { movements, transactions }
            }
            CommitOutcome::AlreadyCommitted => CommitReceipt::AlreadyCommitted,
        }
    }
}

/// Authoritative commit endpoint.
///
/// Implementations must dedupe on `sale_id`: committing an id that is
/// already applied returns `Ok(CommitReceipt::AlreadyCommitted)`.
#[async_trait]
pub trait RemoteSaleProcessor: Send + Sync {
    async fn commit(&self, sale_id: &str, payload: &SalePayload) -> Result<CommitReceipt, CommitError>;
}

// =============================================================================
// Reversal Collaborators
// =============================================================================

/// Query and write surface of the append-only movement ledger.
#[async_trait]
pub trait MovementLedger: Send + Sync {
    /// The `out` row with `reference_id == sale_id` for this variant.
    async fn find_out_by_reference_id(&self, variant_id: &str, sale_id: &str)
        -> SyncResult<Option<StockMovement>>;

    /// Most recent `out` row whose `reference` contains `needle`.
    async fn find_out_by_reference_text(&self, variant_id: &str, needle: &str)
        -> SyncResult<Option<StockMovement>>;

    /// Every `out` row of the variant.
    async fn out_movements(&self, variant_id: &str) -> SyncResult<Vec<StockMovement>>;

    async fn current_quantity(&self, variant_id: &str) -> SyncResult<i64>;

    /// Appends every row and moves each variant to its `new_quantity`.
    /// All or nothing: on error no row was written.
    async fn append_movements(&self, movements: &[NewStockMovement]) -> SyncResult<Vec<StockMovement>>;

    /// Writes `(variant_id, quantity)` pairs without movement rows, all or
    /// nothing. Last resort only.
    async fn set_quantities(&self, targets: &[(String, i64)]) -> SyncResult<()>;
}

#[async_trait]
pub trait FinanceStore: Send + Sync {
    /// Transactions that reference the sale, reversed or not.
    async fn transactions_for_sale(&self, sale_id: &str) -> SyncResult<Vec<AccountTransaction>>;

    async fn balance(&self, account_id: &str) -> SyncResult<Money>;

    /// Adds `delta` and returns the new balance.
    async fn adjust_balance(&self, account_id: &str, delta: Money) -> SyncResult<Money>;

    /// Sets `metadata.reversed`. Returns `false` if it was already set.
    async fn mark_transaction_reversed(
        &self,
        transaction_id: &str,
        at: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> SyncResult<bool>;
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> SyncResult<Option<CustomerAggregate>>;

    async fn set_customer_totals(
        &self,
        customer_id: &str,
        total_spent: Money,
        loyalty_points: i64,
    ) -> SyncResult<()>;
}

#[async_trait]
pub trait SaleStore: Send + Sync {
    async fn load_sale(&self, sale_id: &str) -> SyncResult<Option<(RemoteSale, Vec<RemoteSaleItem>)>>;

    /// Moves a completed sale to `reversing`. Returns `false` if it was
    /// not `completed` any more.
    async fn claim_sale_for_reversal(&self, sale_id: &str, at: DateTime<Utc>) -> SyncResult<bool>;

    /// Moves a claimed sale back to `completed`.
    async fn release_sale_reversal(&self, sale_id: &str, at: DateTime<Utc>) -> SyncResult<bool>;

    /// Flips a claimed sale to reversed. Returns `false` if it was not
    /// `reversing` any more.
    async fn mark_sale_reversed(&self, sale_id: &str, notes: &str, at: DateTime<Utc>) -> SyncResult<bool>;
}

// =============================================================================
// SQLite Adapter
// =============================================================================

/// The reference remote ledger: one SQLite database behind every trait.
#[derive(Debug, Clone)]
pub struct SqliteRemoteLedger {
    db: Database,
}

impl SqliteRemoteLedger {
    pub fn new(db: Database) -> Self {
        SqliteRemoteLedger { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Cheap probe for the connectivity monitor.
    pub async fn is_reachable(&self) -> bool {
        self.db.health_check().await
    }
}

#[async_trait]
impl RemoteSaleProcessor for SqliteRemoteLedger {
    async fn commit(&self, sale_id: &str, payload: &SalePayload) -> Result<CommitReceipt, CommitError> {
        validate_sale_id(sale_id)
            .map_err(|e| CommitError::new(CommitErrorKind::Validation, e.to_string()))?;

        let outcome = self.db.sales().commit_sale(sale_id, payload).await?;
        debug!(sale_id = %sale_id, ?outcome, "Remote commit finished");
        Ok(outcome.into())
    }
}

#[async_trait]
impl MovementLedger for SqliteRemoteLedger {
    async fn find_out_by_reference_id(
        &self,
        variant_id: &str,
        sale_id: &str,
    ) -> SyncResult<Option<StockMovement>> {
        Ok(self.db.inventory().find_out_by_reference_id(variant_id, sale_id).await?)
    }

    async fn find_out_by_reference_text(
        &self,
        variant_id: &str,
        needle: &str,
    ) -> SyncResult<Option<StockMovement>> {
        Ok(self.db.inventory().find_out_by_reference_text(variant_id, needle).await?)
    }

    async fn out_movements(&self, variant_id: &str) -> SyncResult<Vec<StockMovement>> {
        Ok(self.db.inventory().out_movements(variant_id).await?)
    }

    async fn current_quantity(&self, variant_id: &str) -> SyncResult<i64> {
        Ok(self.db.inventory().quantity(variant_id).await?)
    }

    async fn append_movements(&self, movements: &[NewStockMovement]) -> SyncResult<Vec<StockMovement>> {
        Ok(self.db.inventory().append_movements(movements).await?)
    }

    async fn set_quantities(&self, targets: &[(String, i64)]) -> SyncResult<()> {
        Ok(self.db.inventory().set_quantities(targets).await?)
    }
}

#[async_trait]
impl FinanceStore for SqliteRemoteLedger {
    async fn transactions_for_sale(&self, sale_id: &str) -> SyncResult<Vec<AccountTransaction>> {
        Ok(self.db.finance().transactions_for_sale(sale_id).await?)
    }

    async fn balance(&self, account_id: &str) -> SyncResult<Money> {
        Ok(self.db.finance().balance(account_id).await?)
    }

    async fn adjust_balance(&self, account_id: &str, delta: Money) -> SyncResult<Money> {
        Ok(self.db.finance().adjust_balance(account_id, delta).await?)
    }

    async fn mark_transaction_reversed(
        &self,
        transaction_id: &str,
        at: DateTime<Utc>,
        by: &str,
        reason: &str,
    ) -> SyncResult<bool> {
        Ok(self.db.finance().mark_reversed(transaction_id, at, by, reason).await?)
    }
}

#[async_trait]
impl CustomerStore for SqliteRemoteLedger {
    async fn get_customer(&self, customer_id: &str) -> SyncResult<Option<CustomerAggregate>> {
        Ok(self.db.customers().get(customer_id).await?)
    }

    async fn set_customer_totals(
        &self,
        customer_id: &str,
        total_spent: Money,
        loyalty_points: i64,
    ) -> SyncResult<()> {
        Ok(self
            .db
            .customers()
            .set_totals(customer_id, total_spent, loyalty_points)
            .await?)
    }
}

#[async_trait]
impl SaleStore for SqliteRemoteLedger {
    async fn load_sale(&self, sale_id: &str) -> SyncResult<Option<(RemoteSale, Vec<RemoteSaleItem>)>> {
        let sales = self.db.sales();
        match sales.get_by_id(sale_id).await? {
            Some(sale) => {
                let items = sales.get_items(sale_id).await?;
                Ok(Some((sale, items)))
            }
            None => Ok(None),
        }
    }

    async fn claim_sale_for_reversal(&self, sale_id: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        Ok(self.db.sales().claim_reversal(sale_id, at).await?)
    }

    async fn release_sale_reversal(&self, sale_id: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        Ok(self.db.sales().release_reversal(sale_id, at).await?)
    }

    async fn mark_sale_reversed(&self, sale_id: &str, notes: &str, at: DateTime<Utc>) -> SyncResult<bool> {
        Ok(self.db.sales().mark_reversed(sale_id, notes, at).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duka_core::{FinanceAccount, LineItem, PaymentLeg, ProductVariant};
    use duka_db::DbConfig;

    async fn remote() -> SqliteRemoteLedger {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.inventory()
            .insert_variant(&ProductVariant {
                id: "v-1".into(),
                product_id: "p-1".into(),
                sku: "RICE-5KG".into(),
                name: "Rice 5kg".into(),
                quantity: 5,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        db.finance()
            .insert_account(&FinanceAccount {
                id: "acc-cash".into(),
                name: "Cash".into(),
                balance: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        SqliteRemoteLedger::new(db)
    }

    fn payload(qty: i64, account: &str) -> SalePayload {
        SalePayload {
            sale_number: "S-0001".into(),
            customer_id: None,
            items: vec![LineItem {
                id: "li-1".into(),
                product_id: "p-1".into(),
                variant_id: Some("v-1".into()),
                sku: "RICE-5KG".into(),
                name: "Rice 5kg".into(),
                quantity: qty,
                unit_price: Money::new(1_000),
                line_total: Money::new(1_000 * qty),
            }],
            subtotal: Money::new(1_000 * qty),
            tax: Money::zero(),
            discount: Money::zero(),
            total: Money::new(1_000 * qty),
            payments: vec![PaymentLeg {
                account_id: account.into(),
                method: "cash".into(),
                amount: Money::new(1_000 * qty),
            }],
            sold_by: "cashier-1".into(),
            sold_at: Utc::now(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let remote = remote().await;

        let first = remote.commit("sale-1", &payload(2, "acc-cash")).await.unwrap();
        assert!(first.is_new());
        let second = remote.commit("sale-1", &payload(2, "acc-cash")).await.unwrap();
        assert_eq!(second, CommitReceipt::AlreadyCommitted);

        assert_eq!(remote.current_quantity("v-1").await.unwrap(), 3);
        assert_eq!(remote.out_movements("v-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_errors_are_classified() {
        let remote = remote().await;

        let stock = remote.commit("sale-1", &payload(9, "acc-cash")).await.unwrap_err();
        assert_eq!(stock.kind, CommitErrorKind::StockConflict);
        assert!(stock.is_transient());

        let account = remote.commit("sale-2", &payload(1, "acc-nope")).await.unwrap_err();
        assert_eq!(account.kind, CommitErrorKind::Validation);

        let bad_id = remote.commit("bad id", &payload(1, "acc-cash")).await.unwrap_err();
        assert_eq!(bad_id.kind, CommitErrorKind::Validation);

        assert_eq!(remote.current_quantity("v-1").await.unwrap(), 5);
    }
}
