//! # Customer Repository
//!
//! Spend and loyalty aggregates. Both columns carry a `CHECK (>= 0)` so a
//! reversal bug can never push a customer below zero silently.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{DbError, DbResult};
use duka_core::{CustomerAggregate, Money};

/// Repository for customer aggregates.
#[derive(Debug, Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CustomerRepository { pool }
    }

    pub async fn insert(&self, customer: &CustomerAggregate) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, name, total_spent, loyalty_points, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.name)
        .bind(customer.total_spent)
        .bind(customer.loyalty_points)
        .bind(customer.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<CustomerAggregate>> {
        let customer = sqlx::query_as::<_, CustomerAggregate>(
            "SELECT id, name, total_spent, loyalty_points, updated_at FROM customers WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    /// Overwrites both aggregate columns.
    pub async fn set_totals(&self, id: &str, total_spent: Money, loyalty_points: i64) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE customers
            SET total_spent = ?2, loyalty_points = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(total_spent.amount())
        .bind(loyalty_points)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Customer", id));
        }
        Ok(())
    }
}

/// Adds a committed sale to the aggregate. Returns `false` when the
/// customer row does not exist (walk-in ids, customers created elsewhere).
pub(crate) async fn credit_sale(conn: &mut SqliteConnection, id: &str, total: Money) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE customers
        SET total_spent = total_spent + ?2,
            loyalty_points = loyalty_points + ?3,
            updated_at = ?4
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(total.amount())
    .bind(total.loyalty_points())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}
