//! # Quota Governor
//!
//! Keeps the serialized ledger under its byte budget.
//!
//! ## Escalation Ladder
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  run_if_due()  (scheduler tick, debounced to cleanup_interval)          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Standard ──► fits? ── yes ──► persist                                  │
//! │       │ no                                                              │
//! │       ▼                                                                 │
//! │  Aggressive ──► fits? ── yes ──► persist                                │
//! │       │ no                                                              │
//! │       ▼                                                                 │
//! │  Emergency ──► persist (whatever is left)                               │
//! │                                                                         │
//! │  store rejects a write with QuotaExceeded                               │
//! │       └──► Emergency immediately, debounce ignored                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The governor decides what to keep; the ledger owns the records and does
//! the write. A boolean guard keeps two debounced passes from overlapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{LedgerError, SyncResult};
use crate::ledger::LocalSaleLedger;
use duka_core::retention::{apply_tier, CleanupTier, RetentionPolicy};
use duka_core::SaleRecord;

/// What a cleanup pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// Highest tier that ran.
    pub tier: CleanupTier,
    pub removed: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

impl CleanupOutcome {
    pub fn freed_bytes(&self) -> usize {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Serialized size of a record list, as the store would see it.
pub fn serialized_size(records: &[SaleRecord]) -> Result<usize, LedgerError> {
    Ok(serde_json::to_vec(records)?.len())
}

/// Resets the re-entrancy flag when a pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tiered cleanup policy plus its debounce state.
#[derive(Debug)]
pub struct QuotaGovernor {
    policy: RetentionPolicy,
    budget: usize,
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
    running: AtomicBool,
}

impl QuotaGovernor {
    pub fn new(policy: RetentionPolicy, budget: usize, interval: Duration) -> Self {
        QuotaGovernor {
            policy,
            budget,
            interval,
            last_run: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        QuotaGovernor::new(
            config.retention_policy(),
            config.ledger.storage_budget_bytes,
            config.ledger.cleanup_interval(),
        )
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs the ladder from `start` over `records`.
    ///
    /// Each tier works on the previous tier's output; the ladder stops at
    /// the first tier whose result fits the budget.
    pub fn plan(
        &self,
        records: &[SaleRecord],
        start: CleanupTier,
        now: DateTime<Utc>,
    ) -> Result<(Vec<SaleRecord>, CleanupOutcome), LedgerError> {
        let bytes_before = serialized_size(records)?;
        let mut tier = start;
        let mut kept = apply_tier(tier, records, &self.policy, now);
        let mut bytes_after = serialized_size(&kept)?;

        while bytes_after > self.budget {
            match tier.escalate() {
                Some(next) => {
                    debug!(from = %tier, to = %next, bytes = bytes_after, budget = self.budget, "Escalating cleanup");
                    tier = next;
                    kept = apply_tier(tier, &kept, &self.policy, now);
                    bytes_after = serialized_size(&kept)?;
                }
                None => break,
            }
        }

        let outcome = CleanupOutcome {
            tier,
            removed: records.len() - kept.len(),
            bytes_before,
            bytes_after,
        };
        Ok((kept, outcome))
    }

    /// Debounced pass, called from the scheduler tick.
    ///
    /// Returns `None` when skipped: too soon after the last pass, or another
    /// pass is in progress.
    pub async fn run_if_due(&self, ledger: &LocalSaleLedger) -> SyncResult<Option<CleanupOutcome>> {
        if let Some(last) = *self.last_run.lock().await {
            if last.elapsed() < self.interval {
                return Ok(None);
            }
        }
        self.run_guarded(ledger, CleanupTier::Standard).await
    }

    /// Pass starting at `tier`, ignoring the debounce.
    pub async fn run_now(
        &self,
        ledger: &LocalSaleLedger,
        tier: CleanupTier,
    ) -> SyncResult<Option<CleanupOutcome>> {
        self.run_guarded(ledger, tier).await
    }

    async fn run_guarded(
        &self,
        ledger: &LocalSaleLedger,
        tier: CleanupTier,
    ) -> SyncResult<Option<CleanupOutcome>> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already in progress, skipping");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let outcome = ledger.apply_cleanup(tier).await?;
        self.mark_ran().await;
        self.log_outcome(&outcome);
        Ok(Some(outcome))
    }

    /// Records a pass for the debounce clock.
    pub(crate) async fn mark_ran(&self) {
        *self.last_run.lock().await = Some(Instant::now());
    }

    pub(crate) fn log_outcome(&self, outcome: &CleanupOutcome) {
        if outcome.removed == 0 {
            debug!(tier = %outcome.tier, bytes = outcome.bytes_after, "Ledger cleanup: nothing to remove");
            return;
        }
        match outcome.tier {
            CleanupTier::Standard => info!(
                removed = outcome.removed,
                bytes_before = outcome.bytes_before,
                bytes_after = outcome.bytes_after,
                "Ledger cleanup"
            ),
            CleanupTier::Aggressive | CleanupTier::Emergency => warn!(
                tier = %outcome.tier,
                removed = outcome.removed,
                bytes_before = outcome.bytes_before,
                bytes_after = outcome.bytes_after,
                budget = self.budget,
                "Ledger cleanup escalated"
            ),
        }
    }
}

impl Default for QuotaGovernor {
    fn default() -> Self {
        QuotaGovernor::new(
            RetentionPolicy::default(),
            duka_core::DEFAULT_STORAGE_BUDGET_BYTES,
            Duration::from_secs(300),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duka_core::{LineItem, Money, SalePayload, SyncState};

    fn record(id: &str, state: SyncState, age: chrono::Duration) -> SaleRecord {
        let now = Utc::now();
        let payload = SalePayload {
            sale_number: format!("S-{}", id),
            customer_id: None,
            items: vec![LineItem {
                id: format!("li-{}", id),
                product_id: "p-1".into(),
                variant_id: Some("v-1".into()),
                sku: "SKU".into(),
                name: "Item".into(),
                quantity: 1,
                unit_price: Money::new(100),
                line_total: Money::new(100),
            }],
            subtotal: Money::new(100),
            tax: Money::zero(),
            discount: Money::zero(),
            total: Money::new(100),
            payments: vec![],
            sold_by: "cashier".into(),
            sold_at: now - age,
            notes: None,
        };
        let mut r = SaleRecord::new(id, payload, now - age);
        r.sync_state = state;
        r
    }

    #[test]
    fn test_standard_enough_when_under_budget() {
        let governor = QuotaGovernor::default();
        let records = vec![
            record("old-synced", SyncState::Synced, chrono::Duration::days(10)),
            record("pending", SyncState::Pending, chrono::Duration::days(10)),
        ];

        let (kept, outcome) = governor.plan(&records, CleanupTier::Standard, Utc::now()).unwrap();
        assert_eq!(outcome.tier, CleanupTier::Standard);
        assert_eq!(outcome.removed, 1);
        assert_eq!(kept[0].id, "pending");
        assert!(outcome.freed_bytes() > 0);
    }

    #[test]
    fn test_escalates_until_it_fits() {
        let mut records: Vec<SaleRecord> = (0..30)
            .map(|i| record(&format!("synced-{}", i), SyncState::Synced, chrono::Duration::hours(2)))
            .collect();
        records.push(record("pending", SyncState::Pending, chrono::Duration::hours(1)));

        let one = serialized_size(&records[30..]).unwrap();
        let governor = QuotaGovernor::new(RetentionPolicy::default(), one + 8, Duration::from_secs(300));

        let (kept, outcome) = governor.plan(&records, CleanupTier::Standard, Utc::now()).unwrap();
        assert_eq!(outcome.tier, CleanupTier::Emergency);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "pending");
    }
}
