//! # Sale Repository
//!
//! Committed sales on the remote ledger, and the commit itself.
//!
//! ## Commit Transaction
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  commit_sale(sale_id, payload)           SINGLE TRANSACTION             │
//! │                                                                         │
//! │  0. sales row with this id exists?  ──► AlreadyCommitted (no writes)    │
//! │                                                                         │
//! │  1. group items by variant, sum quantities                              │
//! │  2. per variant: stock >= qty?       ──► else InsufficientStock         │
//! │     INSERT out movement (reference_id = sale_id,                        │
//! │                          reference    = "Sale <number> (<id8>)")        │
//! │     UPDATE variant quantity                                             │
//! │  3. INSERT sales + sale_items                                           │
//! │  4. per payment leg: INSERT payment_received, credit the account        │
//! │  5. customer: total_spent += total, loyalty_points += total / 1000      │
//! │                                                                         │
//! │  COMMIT ← all or nothing                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Because step 0 runs inside the same transaction, resubmitting a sale
//! that already went through is a no-op that still reports success.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::repository::{customer, finance, inventory};
use duka_core::{
    AccountTransaction, NewStockMovement, RemoteSale, RemoteSaleItem, SalePayload,
    TransactionMetadata, PAYMENT_RECEIVED, SALE_REFERENCE_PREFIX_LEN,
};

/// What `commit_sale` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// First time this sale id was seen; everything was written.
    Applied { movements: usize, transactions: usize },
    /// A sale with this id already exists; nothing was written.
    AlreadyCommitted,
}

/// Repository for committed sales.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// Gets a sale by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<RemoteSale>> {
        let sale = sqlx::query_as::<_, RemoteSale>(
            r#"
            SELECT id, sale_number, customer_id, total, status, payment_status,
                   notes, created_at, updated_at
            FROM sales
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sale)
    }

    /// Gets all items for a sale.
    pub async fn get_items(&self, sale_id: &str) -> DbResult<Vec<RemoteSaleItem>> {
        let items = sqlx::query_as::<_, RemoteSaleItem>(
            r#"
            SELECT id, sale_id, product_id, variant_id, quantity, unit_price, line_total
            FROM sale_items
            WHERE sale_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Claims a completed sale for reversal (`completed -> reversing`).
    ///
    /// Returns `false` if the sale was not in `completed` state, so only
    /// one reversal can hold the claim.
    pub async fn claim_reversal(&self, id: &str, at: DateTime<Utc>) -> DbResult<bool> {
        self.move_status(id, "completed", "reversing", at).await
    }

    /// Gives a claim back (`reversing -> completed`) after a reversal
    /// aborted before writing anything.
    pub async fn release_reversal(&self, id: &str, at: DateTime<Utc>) -> DbResult<bool> {
        self.move_status(id, "reversing", "completed", at).await
    }

    /// Marks a claimed sale reversed and replaces its notes.
    ///
    /// Returns `false` if the sale was not in `reversing` state.
    pub async fn mark_reversed(&self, id: &str, notes: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sales SET
                status = 'reversed',
                payment_status = 'cancelled',
                notes = ?2,
                updated_at = ?3
            WHERE id = ?1 AND status = 'reversing'
            "#,
        )
        .bind(id)
        .bind(notes)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn move_status(&self, id: &str, from: &str, to: &str, at: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query("UPDATE sales SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2")
            .bind(id)
            .bind(from)
            .bind(to)
            .bind(at)
            .execute(&self.pool)
            .await?;

        debug!(sale_id = %id, from, to, moved = result.rows_affected() == 1, "Sale status transition");
        Ok(result.rows_affected() == 1)
    }

    /// Commits a device sale. See the module docs for the steps.
    pub async fn commit_sale(&self, sale_id: &str, payload: &SalePayload) -> DbResult<CommitOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sales WHERE id = ?1")
            .bind(sale_id)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            debug!(sale_id = %sale_id, "Sale already committed");
            return Ok(CommitOutcome::AlreadyCommitted);
        }

        // Stock: one movement per variant, summed over line items
        let mut per_variant: BTreeMap<&str, (&str, i64)> = BTreeMap::new();
        for item in &payload.items {
            if let Some(variant_id) = item.variant_id.as_deref() {
                let entry = per_variant
                    .entry(variant_id)
                    .or_insert((item.product_id.as_str(), 0));
                entry.1 += item.quantity;
            }
        }

        let short_id: String = sale_id.chars().take(SALE_REFERENCE_PREFIX_LEN).collect();
        let reference = format!("Sale {} ({})", payload.sale_number, short_id);
        for (variant_id, (product_id, quantity)) in &per_variant {
            let available = inventory::variant_quantity(&mut *tx, variant_id).await?;
            if available < *quantity {
                return Err(DbError::InsufficientStock {
                    variant_id: variant_id.to_string(),
                    available,
                    requested: *quantity,
                });
            }

            let movement = NewStockMovement::outbound(*variant_id, *product_id, available, *quantity, now)
                .with_reference(&reference)
                .with_reference_id(sale_id);
            inventory::insert_movement(&mut *tx, &movement).await?;
        }

        // Sale and items
        let inserted = sqlx::query(
            r#"
            INSERT INTO sales (
                id, sale_number, customer_id, total, status, payment_status,
                notes, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'completed', 'completed', ?5, ?6, ?6)
            "#,
        )
        .bind(sale_id)
        .bind(&payload.sale_number)
        .bind(&payload.customer_id)
        .bind(payload.total.amount())
        .bind(&payload.notes)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted.map_err(DbError::from) {
            Ok(_) => {}
            // Lost a race with a concurrent commit of the same id
            Err(DbError::UniqueViolation { .. }) => return Ok(CommitOutcome::AlreadyCommitted),
            Err(e) => return Err(e),
        }

        for item in &payload.items {
            sqlx::query(
                r#"
                INSERT INTO sale_items (
                    id, sale_id, product_id, variant_id, quantity, unit_price, line_total
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(sale_id)
            .bind(&item.product_id)
            .bind(&item.variant_id)
            .bind(item.quantity)
            .bind(item.unit_price.amount())
            .bind(item.line_total.amount())
            .execute(&mut *tx)
            .await?;
        }

        // Payments
        for leg in &payload.payments {
            finance::adjust_balance(&mut *tx, &leg.account_id, leg.amount).await?;
            let transaction = AccountTransaction {
                id: finance::generate_transaction_id(),
                account_id: leg.account_id.clone(),
                amount: leg.amount,
                transaction_type: PAYMENT_RECEIVED.to_string(),
                reference_sale_id: Some(sale_id.to_string()),
                reference_number: Some(payload.sale_number.clone()),
                metadata: TransactionMetadata {
                    sale_id: Some(sale_id.to_string()),
                    ..Default::default()
                },
                created_at: now,
            };
            finance::insert_transaction(&mut *tx, &transaction).await?;
        }

        // Customer
        if let Some(customer_id) = payload.customer_id.as_deref() {
            if !customer::credit_sale(&mut *tx, customer_id, payload.total).await? {
                debug!(customer_id = %customer_id, "No customer row, aggregate not updated");
            }
        }

        tx.commit().await?;

        info!(
            sale_id = %sale_id,
            sale_number = %payload.sale_number,
            variants = per_variant.len(),
            payments = payload.payments.len(),
            "Sale committed"
        );

        Ok(CommitOutcome::Applied {
            movements: per_variant.len(),
            transactions: payload.payments.len(),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use duka_core::{
        CustomerAggregate, FinanceAccount, LineItem, Money, PaymentLeg, ProductVariant,
        SaleStatus,
    };

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        db.inventory()
            .insert_variant(&ProductVariant {
                id: "v-1".into(),
                product_id: "p-1".into(),
                sku: "OIL-1L".into(),
                name: "Cooking oil 1L".into(),
                quantity: 10,
                updated_at: now,
            })
            .await
            .unwrap();
        db.finance()
            .insert_account(&FinanceAccount {
                id: "acc-cash".into(),
                name: "Cash".into(),
                balance: 0,
                updated_at: now,
            })
            .await
            .unwrap();
        db.customers()
            .insert(&CustomerAggregate {
                id: "c-1".into(),
                name: "Wanjiru".into(),
                total_spent: 0,
                loyalty_points: 0,
                updated_at: now,
            })
            .await
            .unwrap();
        db
    }

    fn line(id: &str, qty: i64) -> LineItem {
        LineItem {
            id: id.into(),
            product_id: "p-1".into(),
            variant_id: Some("v-1".into()),
            sku: "OIL-1L".into(),
            name: "Cooking oil 1L".into(),
            quantity: qty,
            unit_price: Money::new(3_000),
            line_total: Money::new(3_000 * qty),
        }
    }

    fn payload(items: Vec<LineItem>) -> SalePayload {
        let total: Money = items.iter().map(|i| i.line_total).sum();
        SalePayload {
            sale_number: "S-0100".into(),
            customer_id: Some("c-1".into()),
            items,
            subtotal: total,
            tax: Money::zero(),
            discount: Money::zero(),
            total,
            payments: vec![PaymentLeg {
                account_id: "acc-cash".into(),
                method: "cash".into(),
                amount: total,
            }],
            sold_by: "cashier".into(),
            sold_at: Utc::now(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_commit_applies_everything() {
        let db = setup().await;
        let outcome = db
            .sales()
            .commit_sale("sale-1", &payload(vec![line("a", 2), line("b", 3)]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CommitOutcome::Applied {
                movements: 1,
                transactions: 1
            }
        );
        assert_eq!(db.inventory().quantity("v-1").await.unwrap(), 5);

        let moves = db.inventory().movements_for_reference("sale-1").await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].quantity, 5);
        assert_eq!(moves[0].reference.as_deref(), Some("Sale S-0100 (sale-1)"));

        let sale = db.sales().get_by_id("sale-1").await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Completed);
        assert_eq!(db.sales().get_items("sale-1").await.unwrap().len(), 2);

        assert_eq!(db.finance().balance("acc-cash").await.unwrap(), Money::new(15_000));
        let c = db.customers().get("c-1").await.unwrap().unwrap();
        assert_eq!(c.total_spent, 15_000);
        assert_eq!(c.loyalty_points, 15);
    }

    #[tokio::test]
    async fn test_resubmission_is_noop() {
        let db = setup().await;
        let p = payload(vec![line("a", 2)]);

        db.sales().commit_sale("sale-1", &p).await.unwrap();
        let again = db.sales().commit_sale("sale-1", &p).await.unwrap();

        assert_eq!(again, CommitOutcome::AlreadyCommitted);
        assert_eq!(db.inventory().quantity("v-1").await.unwrap(), 8);
        assert_eq!(db.inventory().movements_for_reference("sale-1").await.unwrap().len(), 1);
        assert_eq!(db.finance().balance("acc-cash").await.unwrap(), Money::new(6_000));
    }

    #[tokio::test]
    async fn test_insufficient_stock_rolls_back() {
        let db = setup().await;
        let err = db
            .sales()
            .commit_sale("sale-1", &payload(vec![line("a", 11)]))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::InsufficientStock { available: 10, requested: 11, .. }));
        assert!(db.sales().get_by_id("sale-1").await.unwrap().is_none());
        assert_eq!(db.inventory().quantity("v-1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_unknown_account_rolls_back() {
        let db = setup().await;
        let mut p = payload(vec![line("a", 1)]);
        p.payments[0].account_id = "acc-missing".into();

        let err = db.sales().commit_sale("sale-1", &p).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert_eq!(db.inventory().quantity("v-1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_mark_reversed_only_once() {
        let db = setup().await;
        db.sales().commit_sale("sale-1", &payload(vec![line("a", 1)])).await.unwrap();

        let now = Utc::now();
        // Unclaimed sales cannot be marked
        assert!(!db.sales().mark_reversed("sale-1", "[REVERSED]", now).await.unwrap());

        assert!(db.sales().claim_reversal("sale-1", now).await.unwrap());
        assert!(db.sales().mark_reversed("sale-1", "[REVERSED]", now).await.unwrap());
        assert!(!db.sales().mark_reversed("sale-1", "[REVERSED]", now).await.unwrap());
        assert!(db.sales().get_by_id("sale-1").await.unwrap().unwrap().is_reversed());
    }

    #[tokio::test]
    async fn test_reversal_claim_is_exclusive() {
        let db = setup().await;
        db.sales().commit_sale("sale-1", &payload(vec![line("a", 1)])).await.unwrap();
        let now = Utc::now();

        assert!(db.sales().claim_reversal("sale-1", now).await.unwrap());
        assert!(!db.sales().claim_reversal("sale-1", now).await.unwrap());
        assert_eq!(
            db.sales().get_by_id("sale-1").await.unwrap().unwrap().status,
            SaleStatus::Reversing
        );

        assert!(db.sales().release_reversal("sale-1", now).await.unwrap());
        assert!(!db.sales().release_reversal("sale-1", now).await.unwrap());
        assert!(db.sales().claim_reversal("sale-1", now).await.unwrap());
    }
}
