//! # Local Sale Ledger
//!
//! The device's durable queue of sales that have not reached the remote
//! ledger yet.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  append / update / remove / clear                                       │
//! │       │                                                                 │
//! │       ▼  (async mutex held for the whole mutation)                      │
//! │  candidate = records with the change applied                            │
//! │       │                                                                 │
//! │       ├── append only: over max_entries? evict_for_capacity             │
//! │       │      Synced ─► exhausted ─► Pending (logged as emergency)       │
//! │       ├── over the byte budget? ladder from Standard, escalating only   │
//! │       │      while the result still does not fit                        │
//! │       ▼                                                                 │
//! │  store.store(json(candidate))                                           │
//! │       │                                                                 │
//! │       ├── Ok ─────────────────────────► records = candidate             │
//! │       └── QuotaExceeded ─► emergency tier over candidate, store again   │
//! │                               ├── Ok  ► records = trimmed candidate     │
//! │                               └── Err ► error to caller, records kept   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-memory view only changes after the store accepted the write, so a
//! failed mutation leaves both sides as they were.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, SyncError, SyncResult};
use crate::quota::{serialized_size, CleanupOutcome, QuotaGovernor};
use crate::store::LedgerStore;
use duka_core::retention::{evict_for_capacity, CleanupTier};
use duka_core::validation::validate_sale_id;
use duka_core::{FailureClass, SalePayload, SaleRecord, SyncState};

// =============================================================================
// Filters and Patches
// =============================================================================

/// Which records `list` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilter {
    All,
    /// Records in any of these states.
    States(Vec<SyncState>),
    /// `Pending` with attempts left.
    RetryEligible,
}

impl ListFilter {
    pub fn state(state: SyncState) -> Self {
        ListFilter::States(vec![state])
    }

    /// Everything not yet `Synced`.
    pub fn unsynced() -> Self {
        ListFilter::States(vec![SyncState::Pending, SyncState::Syncing, SyncState::Failed])
    }

    fn matches(&self, record: &SaleRecord, max_attempts: u32) -> bool {
        match self {
            ListFilter::All => true,
            ListFilter::States(states) => states.contains(&record.sync_state),
            ListFilter::RetryEligible => record.is_retry_eligible(max_attempts),
        }
    }
}

/// Partial update of a record. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalePatch {
    pub sync_state: Option<SyncState>,
    pub attempts: Option<u32>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<String>>,
    pub error_logged: Option<bool>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the stored class.
    pub failure_class: Option<Option<FailureClass>>,
}

impl SalePatch {
    pub fn state(state: SyncState) -> Self {
        SalePatch {
            sync_state: Some(state),
            ..Default::default()
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self.failure_class = Some(None);
        self
    }

    pub fn error_logged(mut self, logged: bool) -> Self {
        self.error_logged = Some(logged);
        self
    }

    pub fn last_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempt_at = Some(at);
        self
    }

    pub fn failure_class(mut self, class: FailureClass) -> Self {
        self.failure_class = Some(Some(class));
        self
    }

    fn apply(&self, record: &mut SaleRecord) {
        if let Some(state) = self.sync_state {
            record.sync_state = state;
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(error) = &self.last_error {
            record.last_error = error.clone();
        }
        if let Some(logged) = self.error_logged {
            record.error_logged = logged;
        }
        if let Some(at) = self.last_attempt_at {
            record.last_attempt_at = Some(at);
        }
        if let Some(class) = self.failure_class {
            record.failure_class = class;
        }
    }
}

/// Record counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

impl LedgerSummary {
    fn from_records(records: &[SaleRecord]) -> Self {
        let mut summary = LedgerSummary {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            match record.sync_state {
                SyncState::Pending => summary.pending += 1,
                SyncState::Syncing => summary.syncing += 1,
                SyncState::Synced => summary.synced += 1,
                SyncState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Records that have not reached the remote ledger.
    pub fn unsynced(&self) -> usize {
        self.total - self.synced
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Durable, bounded queue of captured sales.
pub struct LocalSaleLedger {
    store: Arc<dyn LedgerStore>,
    governor: Arc<QuotaGovernor>,
    records: Mutex<Vec<SaleRecord>>,
}

impl std::fmt::Debug for LocalSaleLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSaleLedger")
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

impl LocalSaleLedger {
    /// Loads the persisted ledger.
    ///
    /// An absent or undecodable blob starts an empty ledger with a warning.
    /// Records left `Syncing` by a crash go back to `Pending`.
    pub async fn init(store: Arc<dyn LedgerStore>, governor: Arc<QuotaGovernor>) -> SyncResult<Self> {
        let mut records = match store.load().await? {
            None => {
                debug!("No persisted ledger, starting empty");
                Vec::new()
            }
            Some(blob) => match serde_json::from_str::<Vec<SaleRecord>>(&blob) {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, bytes = blob.len(), "Persisted ledger is corrupt, starting empty");
                    Vec::new()
                }
            },
        };

        let mut reset = 0;
        for record in records.iter_mut().filter(|r| r.sync_state == SyncState::Syncing) {
            record.sync_state = SyncState::Pending;
            reset += 1;
        }

        let ledger = LocalSaleLedger {
            store,
            governor,
            records: Mutex::new(Vec::new()),
        };

        if reset > 0 {
            warn!(count = reset, "Interrupted sync attempts reset to pending");
            ledger.persist(&records).await?;
        }

        info!(
            records = records.len(),
            unsynced = records.iter().filter(|r| r.sync_state.is_unsynced()).count(),
            "Sale ledger loaded"
        );
        *ledger.records.lock().await = records;
        Ok(ledger)
    }

    pub fn governor(&self) -> &Arc<QuotaGovernor> {
        &self.governor
    }

    fn max_entries(&self) -> usize {
        self.governor.policy().max_entries
    }

    fn max_attempts(&self) -> u32 {
        self.governor.policy().max_attempts
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queues a captured sale under a fresh id. Returns once it is durable.
    pub async fn append(&self, payload: SalePayload) -> SyncResult<String> {
        let record = SaleRecord::new(Uuid::new_v4().to_string(), payload, Utc::now());
        self.insert(record).await
    }

    /// Queues a record as given, keeping its id and state.
    pub async fn insert(&self, record: SaleRecord) -> SyncResult<String> {
        validate_sale_id(&record.id).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.id == record.id) {
            return Err(SyncError::InvalidPayload(format!(
                "sale {} is already queued",
                record.id
            )));
        }

        let id = record.id.clone();
        let mut candidate = records.clone();
        candidate.push(record);

        let eviction = evict_for_capacity(candidate, self.max_entries(), self.max_attempts());
        if !eviction.evicted.is_empty() {
            let pending = eviction.pending_evicted();
            for (evicted_id, state) in &eviction.evicted {
                if matches!(state, SyncState::Pending | SyncState::Syncing) {
                    warn!(sale_id = %evicted_id, state = %state, "Ledger full: evicting unsynced sale");
                } else {
                    debug!(sale_id = %evicted_id, state = %state, "Ledger full: evicting");
                }
            }
            if pending > 0 {
                warn!(
                    evicted = eviction.evicted.len(),
                    pending_evicted = pending,
                    max_entries = self.max_entries(),
                    "Emergency eviction of pending sales"
                );
            } else {
                info!(evicted = eviction.evicted.len(), "Ledger at capacity, old records evicted");
            }
        }

        self.commit(&mut records, eviction.kept).await?;
        debug!(sale_id = %id, queued = records.len(), "Sale queued");
        Ok(id)
    }

    /// Applies a partial update and returns the updated record.
    pub async fn update(&self, id: &str, patch: SalePatch) -> SyncResult<SaleRecord> {
        let mut records = self.records.lock().await;
        let mut candidate = records.clone();
        let record = candidate
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        patch.apply(record);
        let updated = record.clone();

        self.commit(&mut records, candidate).await?;
        Ok(updated)
    }

    /// Deletes a record. Returns `false` if it was not there.
    pub async fn remove(&self, id: &str) -> SyncResult<bool> {
        let mut records = self.records.lock().await;
        if !records.iter().any(|r| r.id == id) {
            return Ok(false);
        }
        let candidate: Vec<SaleRecord> = records.iter().filter(|r| r.id != id).cloned().collect();
        self.commit(&mut records, candidate).await?;
        Ok(true)
    }

    /// Drops every record. Operator action.
    pub async fn clear(&self) -> SyncResult<usize> {
        let mut records = self.records.lock().await;
        let count = records.len();
        let unsynced = records.iter().filter(|r| r.sync_state.is_unsynced()).count();

        self.store.clear().await?;
        records.clear();

        warn!(removed = count, unsynced, "Sale ledger cleared");
        Ok(count)
    }

    /// Runs the cleanup ladder from `start` and persists the result.
    pub async fn apply_cleanup(&self, start: CleanupTier) -> SyncResult<CleanupOutcome> {
        let mut records = self.records.lock().await;
        let (kept, outcome) = self.governor.plan(&records, start, Utc::now())?;
        if outcome.removed > 0 {
            self.persist(&kept).await?;
            *records = kept;
        }
        Ok(outcome)
    }

    /// Debounced cleanup, see [`QuotaGovernor::run_if_due`].
    pub async fn maybe_cleanup(&self) -> SyncResult<Option<CleanupOutcome>> {
        self.governor.run_if_due(self).await
    }

    /// Persists `candidate` and swaps it in.
    ///
    /// A candidate over the byte budget runs the ladder from Standard first.
    /// A store that still rejects the write gets one emergency pass and one
    /// retry.
    async fn commit(&self, records: &mut Vec<SaleRecord>, candidate: Vec<SaleRecord>) -> SyncResult<()> {
        let size = serialized_size(&candidate)?;
        let candidate = if size > self.governor.budget() {
            debug!(bytes = size, budget = self.governor.budget(), "Ledger write over budget, running cleanup");
            let (kept, outcome) = self
                .governor
                .plan(&candidate, CleanupTier::Standard, Utc::now())?;
            self.governor.mark_ran().await;
            self.governor.log_outcome(&outcome);
            kept
        } else {
            candidate
        };

        match self.persist(&candidate).await {
            Ok(()) => {
                *records = candidate;
                Ok(())
            }
            Err(LedgerError::QuotaExceeded { attempted, budget }) => {
                warn!(attempted, budget, "Ledger write rejected by quota, running emergency cleanup");
                let (kept, outcome) =
                    self.governor
                        .plan(&candidate, CleanupTier::Emergency, Utc::now())?;
                self.persist(&kept).await?;
                *records = kept;

                self.governor.mark_ran().await;
                self.governor.log_outcome(&outcome);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, records: &[SaleRecord]) -> Result<(), LedgerError> {
        let blob = serde_json::to_string(records)?;
        self.store.store(&blob).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Records matching `filter`, in queue order.
    pub async fn list(&self, filter: ListFilter) -> Vec<SaleRecord> {
        let max_attempts = self.max_attempts();
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| filter.matches(r, max_attempts))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<SaleRecord> {
        self.records.lock().await.iter().find(|r| r.id == id).cloned()
    }

    /// Records not yet `Synced`; drives the pending indicator.
    pub async fn pending_count(&self) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.sync_state.is_unsynced())
            .count()
    }

    pub async fn summary(&self) -> LedgerSummary {
        LedgerSummary::from_records(&self.records.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Serialized size of the current records.
    pub async fn size_bytes(&self) -> SyncResult<usize> {
        Ok(serialized_size(&self.records.lock().await)?)
    }
}
