//! # Ledger Stores
//!
//! Where the device ledger's serialized blob lives.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  LocalSaleLedger ──serde_json──► one blob under "pos_offline_sales"     │
//! │                                                                         │
//! │   SqliteLedgerStore   ledger_blobs row, rewritten in a transaction,     │
//! │                       byte budget enforced before the write             │
//! │   MemoryLedgerStore   process memory, optional byte quota               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A store only moves bytes. Decoding, and tolerating a corrupt blob, is the
//! ledger's job.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use duka_core::LEDGER_STORAGE_KEY;
use duka_db::{Database, LedgerBlobRepository};

/// Persistence for the serialized ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The stored blob, `None` if nothing was ever written.
    async fn load(&self) -> Result<Option<String>, LedgerError>;

    /// Replaces the blob atomically. A blob over the byte budget is
    /// rejected with [`LedgerError::QuotaExceeded`] and nothing changes.
    async fn store(&self, blob: &str) -> Result<(), LedgerError>;

    /// Deletes the blob.
    async fn clear(&self) -> Result<(), LedgerError>;

    /// Byte budget, if the store enforces one.
    fn budget(&self) -> Option<usize>;
}

fn check_budget(size: usize, budget: Option<usize>) -> Result<(), LedgerError> {
    match budget {
        Some(budget) if size > budget => Err(LedgerError::QuotaExceeded {
            attempted: size,
            budget,
        }),
        _ => Ok(()),
    }
}

// =============================================================================
// SQLite
// =============================================================================

/// Ledger blob in the device database.
#[derive(Debug, Clone)]
pub struct SqliteLedgerStore {
    repo: LedgerBlobRepository,
    key: String,
    budget: Option<usize>,
}

impl SqliteLedgerStore {
    pub fn new(db: &Database, budget: Option<usize>) -> Self {
        SqliteLedgerStore {
            repo: db.ledger_blobs(),
            key: LEDGER_STORAGE_KEY.to_string(),
            budget,
        }
    }

    /// Uses a different key, e.g. one ledger per cashier profile.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load(&self) -> Result<Option<String>, LedgerError> {
        Ok(self.repo.load(&self.key).await?)
    }

    async fn store(&self, blob: &str) -> Result<(), LedgerError> {
        Ok(self.repo.store(&self.key, blob, self.budget).await?)
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        Ok(self.repo.remove(&self.key).await?)
    }

    fn budget(&self) -> Option<usize> {
        self.budget
    }
}

// =============================================================================
// Memory
// =============================================================================

/// In-process store for tests and ephemeral devices.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    blob: Mutex<Option<String>>,
    quota: Option<usize>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        MemoryLedgerStore {
            blob: Mutex::new(None),
            quota: Some(quota),
        }
    }

    /// Starts from an existing blob, bypassing the quota.
    pub fn with_blob(blob: impl Into<String>) -> Self {
        MemoryLedgerStore {
            blob: Mutex::new(Some(blob.into())),
            quota: None,
        }
    }

    /// Current blob size in bytes.
    pub async fn size(&self) -> usize {
        self.blob.lock().await.as_ref().map_or(0, String::len)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> Result<Option<String>, LedgerError> {
        Ok(self.blob.lock().await.clone())
    }

    async fn store(&self, blob: &str) -> Result<(), LedgerError> {
        check_budget(blob.len(), self.quota)?;
        *self.blob.lock().await = Some(blob.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        *self.blob.lock().await = None;
        Ok(())
    }

    fn budget(&self) -> Option<usize> {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duka_db::DbConfig;

    #[tokio::test]
    async fn test_memory_quota_rejects_without_writing() {
        let store = MemoryLedgerStore::with_quota(8);
        store.store("1234").await.unwrap();

        let err = store.store("123456789").await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(store.load().await.unwrap().as_deref(), Some("1234"));
    }

    #[tokio::test]
    async fn test_sqlite_store_uses_budget() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = SqliteLedgerStore::new(&db, Some(16));

        assert_eq!(store.load().await.unwrap(), None);
        store.store("[]").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("[]"));

        let err = store.store(&"x".repeat(17)).await.unwrap_err();
        assert!(matches!(err, LedgerError::QuotaExceeded { attempted: 17, budget: 16 }));

        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_keys_are_independent() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let a = SqliteLedgerStore::new(&db, None);
        let b = SqliteLedgerStore::new(&db, None).with_key("other_profile");

        a.store("[1]").await.unwrap();
        assert_eq!(b.load().await.unwrap(), None);
    }
}
