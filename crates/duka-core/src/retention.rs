//! # Ledger Retention
//!
//! Which records survive when the device ledger has to shrink.
//!
//! ## Two Different Pressures
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  COUNT (MAX_ENTRIES reached on append)                                  │
//! │    evict_for_capacity: Synced ─► exhausted Failed ─► Pending            │
//! │    Pending is only touched as an emergency and the caller logs it.      │
//! │                                                                         │
//! │  BYTES (serialized blob over the storage budget)                        │
//! │    Standard   synced older than retention window, cap at max_entries    │
//! │        │ still too big                                                  │
//! │        ▼                                                                │
//! │    Aggressive synced older than 1 day, cap at 50                        │
//! │        │ still too big                                                  │
//! │        ▼                                                                │
//! │    Emergency  most recent N unsynced only, no synced history            │
//! │                                                                         │
//! │  Standard and Aggressive never drop an unsynced record.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All functions return records in chronological (`created_at`) order.

use chrono::{DateTime, Duration, Utc};

use crate::types::{SaleRecord, SyncState};
use crate::{MAX_LEDGER_ENTRIES, MAX_SYNC_ATTEMPTS};

// =============================================================================
// Policy
// =============================================================================

/// Thresholds for the cleanup tiers.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Hard cap on ledger size.
    pub max_entries: usize,
    /// Synced records older than this are purged by the standard tier.
    pub retention: Duration,
    /// Synced records older than this are purged by the aggressive tier.
    pub aggressive_retention: Duration,
    /// Overall cap applied by the aggressive tier.
    pub aggressive_keep: usize,
    /// Unsynced records kept by the emergency tier.
    pub emergency_keep: usize,
    /// Attempts after which an unsynced record counts as exhausted.
    pub max_attempts: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            max_entries: MAX_LEDGER_ENTRIES,
            retention: Duration::days(7),
            aggressive_retention: Duration::days(1),
            aggressive_keep: 50,
            emergency_keep: 50,
            max_attempts: MAX_SYNC_ATTEMPTS,
        }
    }
}

/// Escalation level of a cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanupTier {
    Standard,
    Aggressive,
    Emergency,
}

impl CleanupTier {
    /// Tier tried after this one, if any.
    pub fn escalate(self) -> Option<CleanupTier> {
        match self {
            CleanupTier::Standard => Some(CleanupTier::Aggressive),
            CleanupTier::Aggressive => Some(CleanupTier::Emergency),
            CleanupTier::Emergency => None,
        }
    }
}

impl std::fmt::Display for CleanupTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupTier::Standard => write!(f, "standard"),
            CleanupTier::Aggressive => write!(f, "aggressive"),
            CleanupTier::Emergency => write!(f, "emergency"),
        }
    }
}

// =============================================================================
// Tiers
// =============================================================================

fn chronological(mut records: Vec<SaleRecord>) -> Vec<SaleRecord> {
    records.sort_by_key(|r| r.created_at);
    records
}

fn newest_first(mut records: Vec<SaleRecord>) -> Vec<SaleRecord> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    records
}

fn purge_synced_before(records: &[SaleRecord], cutoff: DateTime<Utc>) -> Vec<SaleRecord> {
    records
        .iter()
        .filter(|r| r.sync_state.is_unsynced() || r.created_at > cutoff)
        .cloned()
        .collect()
}

/// Keeps every unsynced record plus the newest synced ones, up to `max`.
///
/// If the unsynced records alone exceed `max`, all of them are still kept.
pub fn cap_preserving_unsynced(records: Vec<SaleRecord>, max: usize) -> Vec<SaleRecord> {
    if records.len() <= max {
        return records;
    }

    let (unsynced, synced): (Vec<_>, Vec<_>) = newest_first(records)
        .into_iter()
        .partition(|r| r.sync_state.is_unsynced());

    let synced_room = max.saturating_sub(unsynced.len());
    let mut kept = unsynced;
    kept.extend(synced.into_iter().take(synced_room));
    chronological(kept)
}

/// Standard tier: retention window purge, then the count cap.
pub fn standard(records: &[SaleRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<SaleRecord> {
    let purged = purge_synced_before(records, now - policy.retention);
    chronological(cap_preserving_unsynced(purged, policy.max_entries))
}

/// Aggressive tier: one-day synced window, overall cap at `aggressive_keep`.
pub fn aggressive(records: &[SaleRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<SaleRecord> {
    let purged = purge_synced_before(records, now - policy.aggressive_retention);
    chronological(cap_preserving_unsynced(purged, policy.aggressive_keep))
}

/// Emergency tier: the most recent `emergency_keep` unsynced records.
pub fn emergency(records: &[SaleRecord], policy: &RetentionPolicy) -> Vec<SaleRecord> {
    let unsynced: Vec<SaleRecord> = records
        .iter()
        .filter(|r| r.sync_state.is_unsynced())
        .cloned()
        .collect();

    chronological(
        newest_first(unsynced)
            .into_iter()
            .take(policy.emergency_keep)
            .collect(),
    )
}

/// Runs a single tier.
pub fn apply_tier(
    tier: CleanupTier,
    records: &[SaleRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<SaleRecord> {
    match tier {
        CleanupTier::Standard => standard(records, policy, now),
        CleanupTier::Aggressive => aggressive(records, policy, now),
        CleanupTier::Emergency => emergency(records, policy),
    }
}

// =============================================================================
// Capacity Eviction
// =============================================================================

/// Result of trimming the ledger down to its count cap.
#[derive(Debug, Clone, Default)]
pub struct CapacityEviction {
    pub kept: Vec<SaleRecord>,
    /// Ids with the state they had, in eviction order.
    pub evicted: Vec<(String, SyncState)>,
}

impl CapacityEviction {
    /// Number of evicted records that had not reached the remote yet and
    /// still had attempts left.
    pub fn pending_evicted(&self) -> usize {
        self.evicted
            .iter()
            .filter(|(_, state)| matches!(state, SyncState::Pending | SyncState::Syncing))
            .count()
    }
}

/// Eviction rank, lower goes first.
fn eviction_rank(record: &SaleRecord, max_attempts: u32) -> u8 {
    match record.sync_state {
        SyncState::Synced => 0,
        SyncState::Failed => 1,
        SyncState::Pending if record.attempts >= max_attempts => 1,
        SyncState::Pending => 2,
        SyncState::Syncing => 3,
    }
}

/// Trims `records` to `max` entries.
///
/// Order: Synced first, then attempts-exhausted records, then Pending, and
/// in-flight Syncing records last. Oldest first within each rank.
pub fn evict_for_capacity(records: Vec<SaleRecord>, max: usize, max_attempts: u32) -> CapacityEviction {
    if records.len() <= max {
        return CapacityEviction {
            kept: records,
            evicted: Vec::new(),
        };
    }

    let excess = records.len() - max;
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by_key(|&i| (eviction_rank(&records[i], max_attempts), records[i].created_at, i));

    let mut evict_idx: Vec<usize> = order.into_iter().take(excess).collect();
    let evicted = evict_idx
        .iter()
        .map(|&i| (records[i].id.clone(), records[i].sync_state))
        .collect();

    evict_idx.sort_unstable();
    let kept = records
        .into_iter()
        .enumerate()
        .filter(|(i, _)| evict_idx.binary_search(i).is_err())
        .map(|(_, r)| r)
        .collect();

    CapacityEviction { kept, evicted }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use crate::types::SalePayload;

    fn record(id: &str, state: SyncState, age_hours: i64, now: DateTime<Utc>) -> SaleRecord {
        let payload = SalePayload {
            sale_number: id.to_string(),
            customer_id: None,
            items: Vec::new(),
            subtotal: Money::zero(),
            tax: Money::zero(),
            discount: Money::zero(),
            total: Money::zero(),
            payments: Vec::new(),
            sold_by: "cashier".into(),
            sold_at: now,
            notes: None,
        };
        let mut r = SaleRecord::new(id, payload, now - Duration::hours(age_hours));
        r.sync_state = state;
        if state == SyncState::Failed {
            r.attempts = MAX_SYNC_ATTEMPTS;
        }
        r
    }

    fn ids(records: &[SaleRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_standard_purges_old_synced_only() {
        let now = Utc::now();
        let records = vec![
            record("old-synced", SyncState::Synced, 24 * 8, now),
            record("old-pending", SyncState::Pending, 24 * 9, now),
            record("new-synced", SyncState::Synced, 2, now),
        ];

        let kept = standard(&records, &RetentionPolicy::default(), now);
        assert_eq!(ids(&kept), vec!["old-pending", "new-synced"]);
    }

    #[test]
    fn test_cap_never_drops_unsynced() {
        let now = Utc::now();
        let mut records = Vec::new();
        for i in 0..4 {
            records.push(record(&format!("p{}", i), SyncState::Pending, 10 - i, now));
        }
        for i in 0..4 {
            records.push(record(&format!("s{}", i), SyncState::Synced, 5 - i, now));
        }

        let kept = cap_preserving_unsynced(records, 5);
        assert_eq!(kept.len(), 5);
        assert_eq!(kept.iter().filter(|r| r.sync_state.is_unsynced()).count(), 4);
        // Newest synced survives
        assert!(kept.iter().any(|r| r.id == "s3"));
    }

    #[test]
    fn test_aggressive_uses_one_day_window() {
        let now = Utc::now();
        let records = vec![
            record("synced-30h", SyncState::Synced, 30, now),
            record("synced-2h", SyncState::Synced, 2, now),
            record("failed-50h", SyncState::Failed, 50, now),
        ];

        let kept = aggressive(&records, &RetentionPolicy::default(), now);
        assert_eq!(ids(&kept), vec!["failed-50h", "synced-2h"]);
    }

    #[test]
    fn test_emergency_keeps_recent_unsynced() {
        let now = Utc::now();
        let policy = RetentionPolicy {
            emergency_keep: 2,
            ..RetentionPolicy::default()
        };
        let records = vec![
            record("p-old", SyncState::Pending, 30, now),
            record("s-new", SyncState::Synced, 1, now),
            record("p-mid", SyncState::Pending, 20, now),
            record("f-new", SyncState::Failed, 2, now),
        ];

        let kept = emergency(&records, &policy);
        assert_eq!(ids(&kept), vec!["p-mid", "f-new"]);
    }

    #[test]
    fn test_capacity_eviction_order() {
        let now = Utc::now();
        let records = vec![
            record("p1", SyncState::Pending, 10, now),
            record("f1", SyncState::Failed, 9, now),
            record("s1", SyncState::Synced, 8, now),
            record("p2", SyncState::Pending, 7, now),
            record("s2", SyncState::Synced, 6, now),
        ];

        let result = evict_for_capacity(records, 2, MAX_SYNC_ATTEMPTS);
        let evicted: Vec<&str> = result.evicted.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(evicted, vec!["s1", "s2", "f1"]);
        assert_eq!(ids(&result.kept), vec!["p1", "p2"]);
        assert_eq!(result.pending_evicted(), 0);
    }

    #[test]
    fn test_capacity_eviction_touches_pending_last() {
        let now = Utc::now();
        let records = vec![
            record("p1", SyncState::Pending, 10, now),
            record("p2", SyncState::Pending, 9, now),
            record("s1", SyncState::Synced, 8, now),
        ];

        let result = evict_for_capacity(records, 1, MAX_SYNC_ATTEMPTS);
        assert_eq!(ids(&result.kept), vec!["p2"]);
        assert_eq!(result.pending_evicted(), 1);
    }

    #[test]
    fn test_tier_escalation() {
        assert_eq!(CleanupTier::Standard.escalate(), Some(CleanupTier::Aggressive));
        assert_eq!(CleanupTier::Aggressive.escalate(), Some(CleanupTier::Emergency));
        assert_eq!(CleanupTier::Emergency.escalate(), None);
    }
}
