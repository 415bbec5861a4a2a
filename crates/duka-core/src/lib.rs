//! # duka-core: Pure Business Logic for Duka POS
//!
//! Everything the offline sale engine decides without touching a disk or a
//! socket lives here: the shape of a queued sale, the money type, payload
//! validation, which ledger records survive a cleanup pass, and how a
//! reversal turns a movement history into restore targets.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Duka POS Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 duka-agent (device runner)                      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │   duka-sync: LocalSaleLedger, QuotaGovernor, SyncScheduler,     │   │
//! │  │              ReversalEngine                                     │   │
//! │  └──────────────┬──────────────────────────────┬───────────────────┘   │
//! │                 │                              │                        │
//! │  ┌──────────────▼──────────────┐  ┌────────────▼────────────────────┐  │
//! │  │  ★ duka-core (THIS CRATE) ★ │  │  duka-db (SQLite)               │  │
//! │  │                             │  │  ledger blob, remote ledger     │  │
//! │  │  types      SaleRecord      │  └─────────────────────────────────┘  │
//! │  │  money      Money           │                                       │
//! │  │  retention  cleanup tiers   │                                       │
//! │  │  reversal   restore plans   │                                       │
//! │  │  validation payload checks  │                                       │
//! │  └─────────────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Ledger records, sale payloads, movements, transactions
//! - [`money`] - Integer money in the smallest currency unit
//! - [`error`] - Domain error types
//! - [`validation`] - Payload validation before a sale is queued
//! - [`retention`] - Eviction order and cleanup tiers for the ledger
//! - [`reversal`] - Pure planning for sale reversal
//!
//! ## Example Usage
//!
//! ```rust
//! use duka_core::money::Money;
//!
//! let total = Money::new(15_000);
//! assert_eq!(total.loyalty_points(), 15);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod money;
pub mod retention;
pub mod reversal;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Fixed key the local ledger blob is stored under.
pub const LEDGER_STORAGE_KEY: &str = "pos_offline_sales";

/// Commit attempts before a queued sale becomes terminally `Failed`.
pub const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Upper bound on records held in the local ledger.
///
/// ## Business Reason
/// A till that stays offline for a whole market day still fits, while the
/// serialized blob stays far below the storage budget.
pub const MAX_LEDGER_ENTRIES: usize = 100;

/// Byte budget for the serialized ledger (5 MiB).
pub const DEFAULT_STORAGE_BUDGET_BYTES: usize = 5 * 1024 * 1024;

/// Currency units spent per loyalty point.
pub const LOYALTY_POINT_VALUE: i64 = 1000;

/// Maximum quantity of a single line item.
///
/// ## Business Reason
/// Catches keying mistakes (1000 instead of 10) before they reach the queue.
pub const MAX_ITEM_QUANTITY: i64 = 9_999;

/// Maximum line items in one sale.
pub const MAX_SALE_ITEMS: usize = 200;

/// Length of the sale id prefix older movement references carry.
pub const SALE_REFERENCE_PREFIX_LEN: usize = 8;
