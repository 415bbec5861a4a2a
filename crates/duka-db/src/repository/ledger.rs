//! # Ledger Blob Repository
//!
//! Key/value storage for the device's serialized sale ledger.
//!
//! ## One Row, Rewritten Whole
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ledger_blobs                                                           │
//! │  ┌──────────────────────┬──────────────────────────┬────────────┐       │
//! │  │ key                  │ value                    │ size_bytes │       │
//! │  ├──────────────────────┼──────────────────────────┼────────────┤       │
//! │  │ pos_offline_sales    │ [{"id":"…", …}, …]       │ 48213      │       │
//! │  └──────────────────────┴──────────────────────────┴────────────┘       │
//! │                                                                         │
//! │  store():                                                               │
//! │    len(value) > budget?  ──► QuotaExceeded, row untouched               │
//! │    BEGIN; upsert; COMMIT  ──► reader sees old blob or new, never half   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Repository for the `ledger_blobs` table.
#[derive(Debug, Clone)]
pub struct LedgerBlobRepository {
    pool: SqlitePool,
}

impl LedgerBlobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LedgerBlobRepository { pool }
    }

    /// Reads the blob stored under `key`, if any.
    pub async fn load(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM ledger_blobs WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    /// Replaces the blob under `key`.
    ///
    /// With a `budget`, a value larger than the budget is rejected with
    /// [`DbError::QuotaExceeded`] before anything is written.
    pub async fn store(&self, key: &str, value: &str, budget: Option<usize>) -> DbResult<()> {
        let size = value.len();
        if let Some(budget) = budget {
            if size > budget {
                return Err(DbError::QuotaExceeded {
                    attempted: size,
                    budget,
                });
            }
        }

        debug!(key = %key, size_bytes = size, "Writing ledger blob");

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO ledger_blobs (key, value, size_bytes, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                size_bytes = excluded.size_bytes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(size as i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Deletes the blob under `key`. Missing keys are not an error.
    pub async fn remove(&self, key: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM ledger_blobs WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stored size of the blob in bytes, 0 when absent.
    pub async fn size(&self, key: &str) -> DbResult<usize> {
        let size: Option<i64> =
            sqlx::query_scalar("SELECT size_bytes FROM ledger_blobs WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(size.unwrap_or(0).max(0) as usize)
    }
}
