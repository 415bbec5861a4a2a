//! # Inventory Repository
//!
//! Product variants and the append-only stock movement ledger.
//!
//! ## Writes Always Come in Pairs
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    SINGLE TRANSACTION                                   │
//! │                                                                         │
//! │  1. INSERT INTO stock_movements (prev 10, qty 3, new 7, type out)       │
//! │  2. UPDATE product_variants SET quantity = 7                            │
//! │        WHERE id = ? AND quantity = 10      ◄── stale read guard         │
//! │                                                                         │
//! │  0 rows updated ─► StaleQuantity, nothing is written                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The movement table rejects UPDATE and DELETE at the schema level, so the
//! ledger can only grow.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use duka_core::{NewStockMovement, ProductVariant, StockMovement};

const MOVEMENT_COLUMNS: &str = r#"
    seq, id, variant_id, product_id, movement_type, quantity,
    previous_quantity, new_quantity, reference, reference_id, notes, created_at
"#;

/// Repository for variants and stock movements.
#[derive(Debug, Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InventoryRepository { pool }
    }

    // =========================================================================
    // Variants
    // =========================================================================

    /// Inserts a variant row.
    pub async fn insert_variant(&self, variant: &ProductVariant) -> DbResult<()> {
        debug!(id = %variant.id, sku = %variant.sku, "Inserting variant");

        sqlx::query(
            r#"
            INSERT INTO product_variants (id, product_id, sku, name, quantity, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&variant.id)
        .bind(&variant.product_id)
        .bind(&variant.sku)
        .bind(&variant.name)
        .bind(variant.quantity)
        .bind(variant.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Gets a variant by ID.
    pub async fn get_variant(&self, id: &str) -> DbResult<Option<ProductVariant>> {
        let variant = sqlx::query_as::<_, ProductVariant>(
            r#"
            SELECT id, product_id, sku, name, quantity, updated_at
            FROM product_variants
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(variant)
    }

    /// Number of variant rows.
    pub async fn count_variants(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM product_variants")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Current stock of a variant.
    pub async fn quantity(&self, variant_id: &str) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        variant_quantity(&mut *conn, variant_id).await
    }

    /// Writes variant quantities directly, without movement rows.
    ///
    /// Only used when appending movements failed and stock still has to
    /// be corrected. All targets land in one transaction: an unknown
    /// variant rolls back every write.
    pub async fn set_quantities(&self, targets: &[(String, i64)]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for (variant_id, quantity) in targets {
            let result = sqlx::query(
                "UPDATE product_variants SET quantity = ?2, updated_at = ?3 WHERE id = ?1",
            )
            .bind(variant_id)
            .bind(quantity)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(DbError::not_found("ProductVariant", variant_id));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Movements
    // =========================================================================

    /// Appends a movement and moves the variant to its `new_quantity`.
    pub async fn append_movement(&self, movement: &NewStockMovement) -> DbResult<StockMovement> {
        let mut tx = self.pool.begin().await?;
        let id = insert_movement(&mut *tx, movement).await?;
        tx.commit().await?;

        self.get_movement(&id)
            .await?
            .ok_or_else(|| DbError::not_found("StockMovement", id))
    }

    /// Appends several movements in one transaction. Any failure (a stale
    /// quantity, an unknown variant) rolls back the whole batch.
    pub async fn append_movements(&self, movements: &[NewStockMovement]) -> DbResult<Vec<StockMovement>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(movements.len());
        for movement in movements {
            ids.push(insert_movement(&mut *tx, movement).await?);
        }
        tx.commit().await?;

        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            let row = self
                .get_movement(&id)
                .await?
                .ok_or_else(|| DbError::not_found("StockMovement", id))?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Gets a movement by ID.
    pub async fn get_movement(&self, id: &str) -> DbResult<Option<StockMovement>> {
        let sql = format!("SELECT {} FROM stock_movements WHERE id = ?1", MOVEMENT_COLUMNS);
        let movement = sqlx::query_as::<_, StockMovement>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(movement)
    }

    /// The `out` movement a sale wrote for this variant.
    pub async fn find_out_by_reference_id(
        &self,
        variant_id: &str,
        sale_id: &str,
    ) -> DbResult<Option<StockMovement>> {
        let sql = format!(
            r#"
            SELECT {} FROM stock_movements
            WHERE variant_id = ?1 AND reference_id = ?2 AND movement_type = 'out'
            ORDER BY seq ASC
            LIMIT 1
            "#,
            MOVEMENT_COLUMNS
        );
        let movement = sqlx::query_as::<_, StockMovement>(&sql)
            .bind(variant_id)
            .bind(sale_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(movement)
    }

    /// Most recent `out` movement whose `reference` text contains `needle`.
    pub async fn find_out_by_reference_text(
        &self,
        variant_id: &str,
        needle: &str,
    ) -> DbResult<Option<StockMovement>> {
        // instr() rather than LIKE: ids contain '_' which LIKE treats as a wildcard
        let sql = format!(
            r#"
            SELECT {} FROM stock_movements
            WHERE variant_id = ?1
              AND movement_type = 'out'
              AND reference IS NOT NULL
              AND instr(reference, ?2) > 0
            ORDER BY seq DESC
            LIMIT 1
            "#,
            MOVEMENT_COLUMNS
        );
        let movement = sqlx::query_as::<_, StockMovement>(&sql)
            .bind(variant_id)
            .bind(needle)
            .fetch_optional(&self.pool)
            .await?;

        Ok(movement)
    }

    /// Every `out` movement of a variant, in insertion order.
    pub async fn out_movements(&self, variant_id: &str) -> DbResult<Vec<StockMovement>> {
        let sql = format!(
            r#"
            SELECT {} FROM stock_movements
            WHERE variant_id = ?1 AND movement_type = 'out'
            ORDER BY seq ASC
            "#,
            MOVEMENT_COLUMNS
        );
        let movements = sqlx::query_as::<_, StockMovement>(&sql)
            .bind(variant_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(movements)
    }

    /// Full movement history of a variant, in insertion order.
    pub async fn movements_for_variant(&self, variant_id: &str) -> DbResult<Vec<StockMovement>> {
        let sql = format!(
            "SELECT {} FROM stock_movements WHERE variant_id = ?1 ORDER BY seq ASC",
            MOVEMENT_COLUMNS
        );
        let movements = sqlx::query_as::<_, StockMovement>(&sql)
            .bind(variant_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(movements)
    }

    /// All movements carrying `reference_id`, any variant.
    pub async fn movements_for_reference(&self, reference_id: &str) -> DbResult<Vec<StockMovement>> {
        let sql = format!(
            "SELECT {} FROM stock_movements WHERE reference_id = ?1 ORDER BY seq ASC",
            MOVEMENT_COLUMNS
        );
        let movements = sqlx::query_as::<_, StockMovement>(&sql)
            .bind(reference_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(movements)
    }
}

// =============================================================================
// Connection-level helpers (shared with the sale commit transaction)
// =============================================================================

pub(crate) async fn variant_quantity(conn: &mut SqliteConnection, variant_id: &str) -> DbResult<i64> {
    let quantity: Option<i64> =
        sqlx::query_scalar("SELECT quantity FROM product_variants WHERE id = ?1")
            .bind(variant_id)
            .fetch_optional(&mut *conn)
            .await?;

    quantity.ok_or_else(|| DbError::not_found("ProductVariant", variant_id))
}

/// Inserts the movement row and updates the variant, guarded on
/// `previous_quantity`. Returns the new movement id.
pub(crate) async fn insert_movement(
    conn: &mut SqliteConnection,
    movement: &NewStockMovement,
) -> DbResult<String> {
    if !movement.is_consistent() {
        return Err(DbError::ConstraintViolation {
            message: format!(
                "movement for {} does not add up: {} {} {} -> {}",
                movement.variant_id,
                movement.previous_quantity,
                movement.movement_type,
                movement.quantity,
                movement.new_quantity
            ),
        });
    }

    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO stock_movements (
            id, variant_id, product_id, movement_type, quantity,
            previous_quantity, new_quantity, reference, reference_id, notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&id)
    .bind(&movement.variant_id)
    .bind(&movement.product_id)
    .bind(movement.movement_type)
    .bind(movement.quantity)
    .bind(movement.previous_quantity)
    .bind(movement.new_quantity)
    .bind(&movement.reference)
    .bind(&movement.reference_id)
    .bind(&movement.notes)
    .bind(movement.created_at)
    .execute(&mut *conn)
    .await?;

    let updated = sqlx::query(
        r#"
        UPDATE product_variants
        SET quantity = ?2, updated_at = ?4
        WHERE id = ?1 AND quantity = ?3
        "#,
    )
    .bind(&movement.variant_id)
    .bind(movement.new_quantity)
    .bind(movement.previous_quantity)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(DbError::StaleQuantity {
            variant_id: movement.variant_id.clone(),
            expected: movement.previous_quantity,
        });
    }

    debug!(
        movement_id = %id,
        variant_id = %movement.variant_id,
        movement_type = %movement.movement_type,
        quantity = movement.quantity,
        "Stock movement recorded"
    );

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use duka_core::MovementType;

    async fn setup(qty: i64) -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.inventory()
            .insert_variant(&ProductVariant {
                id: "v-1".into(),
                product_id: "p-1".into(),
                sku: "MAIZE-2KG".into(),
                name: "Maize flour 2kg".into(),
                quantity: qty,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_append_moves_variant() {
        let db = setup(10).await;
        let repo = db.inventory();

        let out = NewStockMovement::outbound("v-1", "p-1", 10, 3, Utc::now())
            .with_reference("Sale S-1")
            .with_reference_id("sale-1");
        let row = repo.append_movement(&out).await.unwrap();

        assert_eq!(row.movement_type, MovementType::Out);
        assert!(row.is_consistent());
        assert_eq!(repo.quantity("v-1").await.unwrap(), 7);

        let found = repo.find_out_by_reference_id("v-1", "sale-1").await.unwrap();
        assert_eq!(found.map(|m| m.id), Some(row.id));
    }

    #[tokio::test]
    async fn test_stale_previous_quantity_rejected() {
        let db = setup(10).await;
        let repo = db.inventory();

        let stale = NewStockMovement::outbound("v-1", "p-1", 12, 3, Utc::now());
        let err = repo.append_movement(&stale).await.unwrap_err();
        assert!(matches!(err, DbError::StaleQuantity { expected: 12, .. }));
        assert!(err.is_transient());

        assert_eq!(repo.quantity("v-1").await.unwrap(), 10);
        assert!(repo.movements_for_variant("v-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reference_text_search_is_literal() {
        let db = setup(10).await;
        let repo = db.inventory();

        repo.append_movement(
            &NewStockMovement::outbound("v-1", "p-1", 10, 1, Utc::now()).with_reference("Sale ab_12345"),
        )
        .await
        .unwrap();

        assert!(repo.find_out_by_reference_text("v-1", "ab_12345").await.unwrap().is_some());
        assert!(repo.find_out_by_reference_text("v-1", "abx12345").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_movements_are_append_only() {
        let db = setup(10).await;
        let repo = db.inventory();
        let row = repo
            .append_movement(&NewStockMovement::outbound("v-1", "p-1", 10, 1, Utc::now()))
            .await
            .unwrap();

        let err = sqlx::query("DELETE FROM stock_movements WHERE id = ?1")
            .bind(&row.id)
            .execute(db.pool())
            .await
            .map_err(DbError::from)
            .unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn test_set_quantities_unknown_variant_rolls_back() {
        let db = setup(1).await;
        let repo = db.inventory();

        let err = repo
            .set_quantities(&[("v-1".to_string(), 5), ("nope".to_string(), 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
        assert_eq!(repo.quantity("v-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_movement_batch_is_all_or_nothing() {
        let db = setup(10).await;
        let repo = db.inventory();
        repo.insert_variant(&ProductVariant {
            id: "v-2".into(),
            product_id: "p-2".into(),
            sku: "OIL-1L".into(),
            name: "Cooking oil 1l".into(),
            quantity: 4,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        // Second row carries a stale previous quantity
        let batch = [
            NewStockMovement::inbound_to("v-1", "p-1", 10, 13, Utc::now()),
            NewStockMovement::inbound_to("v-2", "p-2", 9, 11, Utc::now()),
        ];
        let err = repo.append_movements(&batch).await.unwrap_err();
        assert!(matches!(err, DbError::StaleQuantity { expected: 9, .. }));

        assert_eq!(repo.quantity("v-1").await.unwrap(), 10);
        assert_eq!(repo.quantity("v-2").await.unwrap(), 4);
        assert!(repo.movements_for_variant("v-1").await.unwrap().is_empty());

        let batch = [
            NewStockMovement::inbound_to("v-1", "p-1", 10, 13, Utc::now()),
            NewStockMovement::inbound_to("v-2", "p-2", 4, 6, Utc::now()),
        ];
        let rows = repo.append_movements(&batch).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(repo.quantity("v-1").await.unwrap(), 13);
        assert_eq!(repo.quantity("v-2").await.unwrap(), 6);
    }
}
