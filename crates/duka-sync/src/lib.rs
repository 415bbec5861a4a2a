//! # duka-sync: Offline Sale Engine for Duka POS
//!
//! Lets a till keep selling while the remote ledger is unreachable, drains
//! the queued sales once it is back, and undoes committed sales on request.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Device (the till)                              │
//! │                                                                         │
//! │   checkout ──capture()──► ┌──────────────────┐ ◄── QuotaGovernor        │
//! │                           │  LocalSaleLedger │     tiered cleanup,      │
//! │                           │  Pending/Syncing │     debounced            │
//! │                           │  /Synced/Failed  │                          │
//! │                           └────────┬─────────┘                          │
//! │                                    │                                    │
//! │   ConnectivityMonitor ──edge──► SyncScheduler ◄── 30s timer             │
//! │                                    │  single-flight per sale id         │
//! │                                    │  backoff, bounded attempts         │
//! └────────────────────────────────────┼────────────────────────────────────┘
//!                                      │ commit(sale_id, payload)
//!                                      ▼ idempotent on sale_id
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Remote ledger                                   │
//! │                                                                         │
//! │   RemoteSaleProcessor   sales, stock-out movements, payments, customer  │
//! │                                                                         │
//! │   ReversalEngine ──► MovementLedger   restore to historical baseline    │
//! │                  ──► FinanceStore     one net adjustment per account    │
//! │                  ──► CustomerStore    roll back totals, floored at 0    │
//! │                  ──► SaleStore        status = reversed                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Device side
//! - [`store`] - Durable blob storage behind the ledger
//! - [`ledger`] - `LocalSaleLedger`, the bounded queue of unsynced sales
//! - [`quota`] - `QuotaGovernor`, tiered cleanup under the storage budget
//! - [`scheduler`] - `SyncScheduler`, drains the ledger
//! - [`retry`] - Per-record backoff schedule
//! - [`connectivity`] - Online/offline flag with change notification
//!
//! ### Remote side
//! - [`remote`] - Remote ledger traits and the SQLite adapter
//! - [`reversal`] - `ReversalEngine`
//!
//! ### Shared
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Error types
//! - [`hooks`] - Notifications after commit and reversal
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duka_sync::{EngineConfig, LocalSaleLedger, QuotaGovernor, SyncScheduler};
//!
//! let config = EngineConfig::load_or_default(None);
//!
//! let store = Arc::new(SqliteLedgerStore::new(&local_db, Some(config.ledger.storage_budget_bytes)));
//! let governor = Arc::new(QuotaGovernor::from_config(&config));
//! let ledger = Arc::new(LocalSaleLedger::init(store, governor).await?);
//!
//! let scheduler = Arc::new(SyncScheduler::new(
//!     ledger,
//!     Arc::new(SqliteRemoteLedger::new(remote_db)),
//!     ConnectivityMonitor::new(true),
//!     SchedulerOptions::from_config(&config),
//! ));
//! scheduler.start().await?;
//!
//! let sale_id = scheduler.capture(payload).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod hooks;

// Device side
pub mod connectivity;
pub mod ledger;
pub mod quota;
pub mod retry;
pub mod scheduler;
pub mod store;

// Remote side
pub mod remote;
pub mod reversal;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    DeviceConfig, EngineConfig, LedgerSettings, ReversalSettings, StorageSettings, SyncSettings,
};
pub use connectivity::ConnectivityMonitor;
pub use error::{
    CommitError, CommitErrorKind, LedgerError, ReversalError, SyncError, SyncResult,
};
pub use hooks::{HookError, HookResult, NoOpHooks, SaleEventHooks};
pub use ledger::{LedgerSummary, ListFilter, LocalSaleLedger, SalePatch};
pub use quota::{CleanupOutcome, QuotaGovernor};
pub use remote::{
    CommitReceipt, CustomerStore, FinanceStore, MovementLedger, RemoteSaleProcessor, SaleStore,
    SqliteRemoteLedger,
};
pub use retry::RetryPolicy;
pub use reversal::{ReversalEngine, ReversalReport, RestoreMethod, VariantRestoreReport};
pub use scheduler::{AttemptOutcome, SchedulerOptions, SyncRunReport, SyncScheduler, SyncStatus};
pub use store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};
