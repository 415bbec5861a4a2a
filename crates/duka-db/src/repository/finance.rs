//! # Finance Repository
//!
//! Finance accounts and the payment transactions booked against them.
//!
//! Reversal bookkeeping lives in the `metadata` JSON column of each
//! transaction (`reversed`, `reversed_at`, `reversed_by`,
//! `reversal_reason`), so a transaction is flagged exactly once no matter
//! how many times the sale reversal is retried.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use duka_core::{AccountTransaction, FinanceAccount, Money, TransactionMetadata};

/// Raw `account_transactions` row; metadata still JSON text.
#[derive(Debug, FromRow)]
struct TransactionRow {
    id: String,
    account_id: String,
    amount: i64,
    transaction_type: String,
    reference_sale_id: Option<String>,
    reference_number: Option<String>,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for AccountTransaction {
    type Error = DbError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let metadata: TransactionMetadata = if row.metadata.trim().is_empty() {
            TransactionMetadata::default()
        } else {
            serde_json::from_str(&row.metadata).map_err(|e| DbError::Corrupt {
                what: format!("metadata of transaction {}", row.id),
                reason: e.to_string(),
            })?
        };

        Ok(AccountTransaction {
            id: row.id,
            account_id: row.account_id,
            amount: Money::new(row.amount),
            transaction_type: row.transaction_type,
            reference_sale_id: row.reference_sale_id,
            reference_number: row.reference_number,
            metadata,
            created_at: row.created_at,
        })
    }
}

/// Repository for finance accounts and transactions.
#[derive(Debug, Clone)]
pub struct FinanceRepository {
    pool: SqlitePool,
}

impl FinanceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        FinanceRepository { pool }
    }

    /// Inserts an account.
    pub async fn insert_account(&self, account: &FinanceAccount) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO finance_accounts (id, name, balance, updated_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&account.id)
        .bind(&account.name)
        .bind(account.balance)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Gets an account by ID.
    pub async fn get_account(&self, id: &str) -> DbResult<Option<FinanceAccount>> {
        let account = sqlx::query_as::<_, FinanceAccount>(
            "SELECT id, name, balance, updated_at FROM finance_accounts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Current balance of an account.
    pub async fn balance(&self, id: &str) -> DbResult<Money> {
        self.get_account(id)
            .await?
            .map(|a| a.balance())
            .ok_or_else(|| DbError::not_found("FinanceAccount", id))
    }

    /// Adds `delta` (may be negative) to an account balance.
    pub async fn adjust_balance(&self, id: &str, delta: Money) -> DbResult<Money> {
        let mut conn = self.pool.acquire().await?;
        adjust_balance(&mut *conn, id, delta).await?;
        self.balance(id).await
    }

    /// Inserts a transaction row without touching balances.
    pub async fn insert_transaction(&self, tx: &AccountTransaction) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_transaction(&mut *conn, tx).await
    }

    /// Transactions tied to a sale, by `reference_sale_id` or by
    /// `metadata.sale_id`.
    pub async fn transactions_for_sale(&self, sale_id: &str) -> DbResult<Vec<AccountTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, account_id, amount, transaction_type, reference_sale_id,
                   reference_number, metadata, created_at
            FROM account_transactions
            WHERE reference_sale_id = ?1
               OR (json_valid(metadata) AND json_extract(metadata, '$.sale_id') = ?1)
            ORDER BY created_at, id
            "#,
        )
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AccountTransaction::try_from).collect()
    }

    /// Gets a transaction by ID.
    pub async fn get_transaction(&self, id: &str) -> DbResult<Option<AccountTransaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, account_id, amount, transaction_type, reference_sale_id,
                   reference_number, metadata, created_at
            FROM account_transactions
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountTransaction::try_from).transpose()
    }

    /// Flags a transaction as reversed.
    ///
    /// Returns `false` when it already was; the stored metadata is then
    /// left as it is.
    pub async fn mark_reversed(
        &self,
        id: &str,
        reversed_at: DateTime<Utc>,
        reversed_by: &str,
        reason: &str,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let raw: Option<String> =
            sqlx::query_scalar("SELECT metadata FROM account_transactions WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let raw = raw.ok_or_else(|| DbError::not_found("AccountTransaction", id))?;

        let mut metadata: TransactionMetadata = if raw.trim().is_empty() {
            TransactionMetadata::default()
        } else {
            serde_json::from_str(&raw)?
        };
        if metadata.reversed {
            return Ok(false);
        }

        metadata.reversed = true;
        metadata.reversed_at = Some(reversed_at);
        metadata.reversed_by = Some(reversed_by.to_string());
        metadata.reversal_reason = Some(reason.to_string());

        sqlx::query("UPDATE account_transactions SET metadata = ?2 WHERE id = ?1")
            .bind(id)
            .bind(serde_json::to_string(&metadata)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(transaction_id = %id, "Transaction marked reversed");
        Ok(true)
    }
}

// =============================================================================
// Connection-level helpers (shared with the sale commit transaction)
// =============================================================================

pub(crate) async fn adjust_balance(
    conn: &mut SqliteConnection,
    account_id: &str,
    delta: Money,
) -> DbResult<()> {
    let result = sqlx::query(
        "UPDATE finance_accounts SET balance = balance + ?2, updated_at = ?3 WHERE id = ?1",
    )
    .bind(account_id)
    .bind(delta.amount())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("FinanceAccount", account_id));
    }
    Ok(())
}

pub(crate) async fn insert_transaction(
    conn: &mut SqliteConnection,
    tx: &AccountTransaction,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO account_transactions (
            id, account_id, amount, transaction_type, reference_sale_id,
            reference_number, metadata, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&tx.id)
    .bind(&tx.account_id)
    .bind(tx.amount.amount())
    .bind(&tx.transaction_type)
    .bind(&tx.reference_sale_id)
    .bind(&tx.reference_number)
    .bind(serde_json::to_string(&tx.metadata)?)
    .bind(tx.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// New transaction id.
pub fn generate_transaction_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use duka_core::PAYMENT_RECEIVED;

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.finance()
            .insert_account(&FinanceAccount {
                id: "acc-cash".into(),
                name: "Cash drawer".into(),
                balance: 50_000,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        db
    }

    fn payment(id: &str, sale: Option<&str>, meta_sale: Option<&str>) -> AccountTransaction {
        AccountTransaction {
            id: id.into(),
            account_id: "acc-cash".into(),
            amount: Money::new(4_000),
            transaction_type: PAYMENT_RECEIVED.into(),
            reference_sale_id: sale.map(String::from),
            reference_number: Some("S-1".into()),
            metadata: TransactionMetadata {
                sale_id: meta_sale.map(String::from),
                ..Default::default()
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_transactions_found_by_column_or_metadata() {
        let db = setup().await;
        let repo = db.finance();

        repo.insert_transaction(&payment("t-1", Some("sale-1"), None)).await.unwrap();
        repo.insert_transaction(&payment("t-2", None, Some("sale-1"))).await.unwrap();
        repo.insert_transaction(&payment("t-3", Some("sale-2"), None)).await.unwrap();

        let found = repo.transactions_for_sale("sale-1").await.unwrap();
        let mut ids: Vec<_> = found.iter().map(|t| t.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["t-1", "t-2"]);
    }

    #[tokio::test]
    async fn test_mark_reversed_once() {
        let db = setup().await;
        let repo = db.finance();
        repo.insert_transaction(&payment("t-1", Some("sale-1"), None)).await.unwrap();

        let now = Utc::now();
        assert!(repo.mark_reversed("t-1", now, "manager", "returned").await.unwrap());
        assert!(!repo.mark_reversed("t-1", now, "manager", "again").await.unwrap());

        let tx = repo.get_transaction("t-1").await.unwrap().unwrap();
        assert!(tx.is_reversed());
        assert_eq!(tx.metadata.reversal_reason.as_deref(), Some("returned"));
    }

    #[tokio::test]
    async fn test_adjust_balance() {
        let db = setup().await;
        let balance = db.finance().adjust_balance("acc-cash", Money::new(-12_500)).await.unwrap();
        assert_eq!(balance, Money::new(37_500));

        let err = db.finance().adjust_balance("nope", Money::new(1)).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}
