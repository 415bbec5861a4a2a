//! # Error Types
//!
//! Domain-specific error types for duka-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  duka-core errors (this file)                                          │
//! │  ├── CoreError        - Sale shape and business rule violations        │
//! │  └── ValidationError  - Field level failures                           │
//! │                                                                         │
//! │  duka-db errors                                                        │
//! │  └── DbError          - SQLite failures, quota, stock conflicts        │
//! │                                                                         │
//! │  duka-sync errors                                                      │
//! │  ├── SyncError        - Ledger, scheduler, config                      │
//! │  ├── CommitError      - Remote commit failures (transient / fatal)     │
//! │  └── ReversalError    - Reversal conflicts and aborted restores        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Business rule violations for a sale.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The sale carries no line items.
    #[error("Sale {sale_number} has no items")]
    EmptySale { sale_number: String },

    /// Too many line items in one sale.
    #[error("Sale cannot have more than {max} items")]
    TooManyItems { max: usize },

    /// Line item quantity outside the allowed range.
    #[error("Quantity {requested} for {sku} exceeds maximum allowed ({max})")]
    QuantityTooLarge {
        sku: String,
        requested: i64,
        max: i64,
    },

    /// Payment legs add up to more than the sale total.
    ///
    /// ## When This Occurs
    /// - Split tender keyed wrong at the till
    /// - Payload assembled from a stale cart
    ///
    /// Paying less than the total is allowed (credit sales).
    #[error("Payments total {paid} exceeds sale total {total}")]
    Overpayment { paid: i64, total: i64 },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Field validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must not be negative.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
