//! # Engine Error Types
//!
//! Error types for the ledger, the scheduler and the reversal engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Engine Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  SyncError      │  │  LedgerError    │  │  CommitError            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  QuotaExceeded  │  │  kind: StockConflict    │ │
//! │  │  InvalidPayload │  │  Store          │  │        Timeout, Network │ │
//! │  │  DatabaseError  │  │  Serialization  │  │        Validation       │ │
//! │  │  ShuttingDown   │  │  NotFound       │  │        Schema, Internal │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  ReversalError                                                  │   │
//! │  │  conflicts (no mutation): NotFound, AlreadyReversed, MidSync,   │   │
//! │  │                           InProgress, NoItems, Conflict         │   │
//! │  │  aborted:                 StockRestoreFailed, Store             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use duka_core::{CoreError, FailureClass};
use duka_db::DbError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine error covering configuration, storage and lifecycle failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID.
    #[error("Device ID not configured")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Capture Errors
    // =========================================================================
    /// Sale payload rejected before it was queued.
    #[error("Invalid sale: {0}")]
    InvalidPayload(String),

    // =========================================================================
    // Ledger / Remote Errors
    // =========================================================================
    /// Local ledger failure.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Remote commit failure.
    #[error(transparent)]
    Commit(#[from] CommitError),

    /// Remote record missing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal engine error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Scheduler is shutting down.
    #[error("Sync scheduler is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::InvalidPayload(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Ledger(LedgerError::Serialization(err.to_string()))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried later.
    ///
    /// ## Retryable Errors
    /// - Transient commit failures (stock conflict, timeout, network)
    /// - Ledger quota rejections (the cleanup ladder may free space)
    /// - Database errors (locked, pool timeouts)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Commit(e) => e.is_transient(),
            SyncError::Ledger(LedgerError::QuotaExceeded { .. }) => true,
            SyncError::Ledger(LedgerError::Store(_)) => true,
            SyncError::DatabaseError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

// =============================================================================
// Ledger Error
// =============================================================================

/// Failures of the device ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store refused the write because of its byte budget.
    #[error("Ledger storage quota exceeded: {attempted} bytes over a budget of {budget}")]
    QuotaExceeded { attempted: usize, budget: usize },

    /// The store failed for any other reason.
    #[error("Ledger store failed: {0}")]
    Store(String),

    #[error("Ledger serialization failed: {0}")]
    Serialization(String),

    #[error("Sale record not found: {0}")]
    NotFound(String),
}

impl LedgerError {
    pub fn is_quota(&self) -> bool {
        matches!(self, LedgerError::QuotaExceeded { .. })
    }
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::QuotaExceeded { attempted, budget } => {
                LedgerError::QuotaExceeded { attempted, budget }
            }
            other => LedgerError::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

// =============================================================================
// Commit Error
// =============================================================================

/// Why the remote processor refused or failed a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitErrorKind {
    /// Not enough stock, or stock moved underneath the commit.
    StockConflict,
    /// The commit did not answer in time.
    Timeout,
    /// Remote unreachable or busy.
    Network,
    /// The payload refers to things the remote does not accept.
    Validation,
    /// Remote data or schema is not what the engine expects.
    Schema,
    /// Anything else.
    Internal,
}

impl CommitErrorKind {
    /// Retry policy class.
    ///
    /// ```text
    /// StockConflict, Timeout, Network, Internal  → Transient (quiet retries)
    /// Validation, Schema                         → Fatal (logged at once)
    /// ```
    pub fn failure_class(&self) -> FailureClass {
        match self {
            CommitErrorKind::Validation | CommitErrorKind::Schema => FailureClass::Fatal,
            CommitErrorKind::StockConflict
            | CommitErrorKind::Timeout
            | CommitErrorKind::Network
            | CommitErrorKind::Internal => FailureClass::Transient,
        }
    }
}

impl std::fmt::Display for CommitErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitErrorKind::StockConflict => write!(f, "stock conflict"),
            CommitErrorKind::Timeout => write!(f, "timeout"),
            CommitErrorKind::Network => write!(f, "network"),
            CommitErrorKind::Validation => write!(f, "validation"),
            CommitErrorKind::Schema => write!(f, "schema"),
            CommitErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// A failed remote commit.
#[derive(Debug, Clone, Error)]
#[error("Commit failed ({kind}): {message}")]
pub struct CommitError {
    pub kind: CommitErrorKind,
    pub message: String,
}

impl CommitError {
    pub fn new(kind: CommitErrorKind, message: impl Into<String>) -> Self {
        CommitError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        CommitError::new(
            CommitErrorKind::Timeout,
            format!("no answer after {}ms", after.as_millis()),
        )
    }

    pub fn failure_class(&self) -> FailureClass {
        self.kind.failure_class()
    }

    pub fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }
}

/// Maps remote ledger errors onto commit kinds.
///
/// ## Mapping
/// ```text
/// InsufficientStock, StaleQuantity            → StockConflict
/// PoolExhausted, ConnectionFailed, busy/locked → Network
/// NotFound, ForeignKey, Unique, Constraint     → Validation
/// Corrupt, MigrationFailed                     → Schema
/// everything else                              → Internal
/// ```
impl From<DbError> for CommitError {
    fn from(err: DbError) -> Self {
        let kind = match &err {
            DbError::InsufficientStock { .. } | DbError::StaleQuantity { .. } => {
                CommitErrorKind::StockConflict
            }
            DbError::NotFound { .. }
            | DbError::ForeignKeyViolation { .. }
            | DbError::UniqueViolation { .. }
            | DbError::ConstraintViolation { .. } => CommitErrorKind::Validation,
            DbError::Corrupt { .. } | DbError::MigrationFailed(_) => CommitErrorKind::Schema,
            e if e.is_transient() => CommitErrorKind::Network,
            _ => CommitErrorKind::Internal,
        };
        CommitError::new(kind, err.to_string())
    }
}

// =============================================================================
// Reversal Error
// =============================================================================

/// Why a reversal was refused or aborted.
///
/// Every variant except `StockRestoreFailed` and `Store` is raised before
/// the first write.
#[derive(Debug, Error)]
pub enum ReversalError {
    #[error("Sale {0} not found")]
    NotFound(String),

    #[error("Sale {0} is already reversed")]
    AlreadyReversed(String),

    #[error("Sale {0} is still being synced from this device")]
    MidSync(String),

    /// An earlier reversal claimed the sale and never marked it reversed.
    #[error("Sale {0} has a reversal in progress")]
    InProgress(String),

    #[error("Sale {0} has no line items to reverse")]
    NoItems(String),

    /// Another reversal finished first.
    #[error("Reversal conflict on sale {sale_id}: {reason}")]
    Conflict { sale_id: String, reason: String },

    /// Stock could not be restored; the sale is left as it was.
    #[error("Stock restore failed for variant {variant_id}: {reason}")]
    StockRestoreFailed { variant_id: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),
}

impl ReversalError {
    /// True for the refusals that never touch any data.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReversalError::NotFound(_)
                | ReversalError::AlreadyReversed(_)
                | ReversalError::MidSync(_)
                | ReversalError::InProgress(_)
                | ReversalError::NoItems(_)
                | ReversalError::Conflict { .. }
        )
    }
}

impl From<SyncError> for ReversalError {
    fn from(err: SyncError) -> Self {
        ReversalError::Store(err.to_string())
    }
}
