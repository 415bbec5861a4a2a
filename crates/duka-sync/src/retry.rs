//! # Per-Record Retry Delay
//!
//! A `Pending` record that already failed waits before its next attempt:
//!
//! ```text
//! attempts   0     1     2     3     4     5     6
//! delay      0s    2s    4s    8s    16s   32s   60s (capped)
//! ```
//!
//! The delays come from `backoff::ExponentialBackoff` with randomization
//! off, so the schedule is the same on every device.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};

use crate::config::SyncSettings;
use duka_core::SaleRecord;

/// Delay schedule between attempts of one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        RetryPolicy {
            initial: settings.initial_backoff(),
            max: settings.max_backoff(),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No waiting at all. Useful for tests and manual drains.
    pub fn immediate() -> Self {
        RetryPolicy {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Wait after `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let mut backoff = self.create_backoff();
        let mut delay = Duration::ZERO;
        for _ in 0..attempts {
            delay = backoff.next_backoff().unwrap_or(self.max);
        }
        delay.min(self.max)
    }

    /// Earliest time the record may be attempted again.
    pub fn next_attempt_at(&self, record: &SaleRecord) -> Option<DateTime<Utc>> {
        let last = record.last_attempt_at?;
        let delay = chrono::Duration::from_std(self.delay_for(record.attempts)).ok()?;
        Some(last + delay)
    }

    /// True when the record's backoff has elapsed.
    pub fn is_due(&self, record: &SaleRecord, now: DateTime<Utc>) -> bool {
        self.next_attempt_at(record).map_or(true, |at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duka_core::{Money, SalePayload};

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn test_is_due() {
        let payload = SalePayload {
            sale_number: "S-1".into(),
            customer_id: None,
            items: vec![],
            subtotal: Money::zero(),
            tax: Money::zero(),
            discount: Money::zero(),
            total: Money::zero(),
            payments: vec![],
            sold_by: "c".into(),
            sold_at: Utc::now(),
            notes: None,
        };
        let now = Utc::now();
        let mut record = SaleRecord::new("sale-1", payload, now);
        let policy = RetryPolicy::default();
        assert!(policy.is_due(&record, now));

        record.attempts = 1;
        record.last_attempt_at = Some(now);
        assert!(!policy.is_due(&record, now + chrono::Duration::seconds(1)));
        assert!(policy.is_due(&record, now + chrono::Duration::seconds(2)));

        assert!(RetryPolicy::immediate().is_due(&record, now));
    }
}
