//! # duka-db: SQLite Layer for Duka POS
//!
//! Storage for both sides of the offline sale engine: the device's own
//! ledger blob, and the reference remote ledger the device commits into.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Duka POS Data Flow                               │
//! │                                                                         │
//! │  duka-sync (LocalSaleLedger, SqliteRemoteLedger, ReversalEngine)        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                     duka-db (THIS CRATE)                        │    │
//! │  │                                                                 │    │
//! │  │   ┌───────────────┐    ┌─────────────────┐   ┌──────────────┐   │    │
//! │  │   │   Database    │    │  Repositories   │   │  Migrations  │   │    │
//! │  │   │   (pool.rs)   │    │                 │   │  (embedded)  │   │    │
//! │  │   │               │◄───│ LedgerBlob      │   │ 001_initial  │   │    │
//! │  │   │ SqlitePool    │    │ Inventory, Sale │   │              │   │    │
//! │  │   │ WAL, FKs      │    │ Finance, Cust.  │   │              │   │    │
//! │  │   └───────────────┘    └─────────────────┘   └──────────────┘   │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  device.db (ledger_blobs)          remote.db (ledger tables)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use duka_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("remote.db")).await?;
//! let outcome = db.sales().commit_sale(&sale_id, &payload).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::customer::CustomerRepository;
pub use repository::finance::FinanceRepository;
pub use repository::inventory::InventoryRepository;
pub use repository::ledger::LedgerBlobRepository;
pub use repository::sale::{CommitOutcome, SaleRepository};
