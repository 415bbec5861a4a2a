//! # Money Module
//!
//! Provides the `Money` type for sale totals, payment legs and account
//! balances.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Every amount is an i64 in the smallest currency unit.                  │
//! │                                                                         │
//! │  Reversal nets payments per account and subtracts them from balances.   │
//! │  With floats, reversing three 33.33 legs leaves 0.0000001 behind and    │
//! │  the account never returns to its pre-sale balance.                     │
//! │                                                                         │
//! │  With integers the round trip is exact:                                 │
//! │    balance 100_000 + 15_000 - 15_000 == 100_000                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use duka_core::money::Money;
//!
//! let price = Money::new(2_500);
//! let line = price.multiply_quantity(3);
//! assert_eq!(line.amount(), 7_500);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use ts_rs::TS;

use crate::LOYALTY_POINT_VALUE;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit.
///
/// Serialized as a bare integer so the ledger blob stays compact and
/// readable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, TS,
)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from an amount in the smallest unit.
    #[inline]
    pub const fn new(amount: i64) -> Self {
        Money(amount)
    }

    /// Returns the raw amount.
    #[inline]
    pub const fn amount(&self) -> i64 {
        self.0
    }

    /// Zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Returns the absolute value.
    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Multiplies a unit price by a quantity.
    ///
    /// ## Example
    /// ```rust
    /// use duka_core::money::Money;
    ///
    /// assert_eq!(Money::new(1_200).multiply_quantity(4).amount(), 4_800);
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Subtracts `other`, flooring the result at zero.
    ///
    /// Customer aggregates use this on reversal: `total_spent` can never
    /// go negative even if it was edited by hand after the sale.
    ///
    /// ```rust
    /// use duka_core::money::Money;
    ///
    /// let spent = Money::new(4_000);
    /// assert_eq!(spent.saturating_sub_floor(Money::new(9_000)), Money::zero());
    /// ```
    #[inline]
    pub const fn saturating_sub_floor(&self, other: Money) -> Self {
        let diff = self.0.saturating_sub(other.0);
        if diff < 0 {
            Money(0)
        } else {
            Money(diff)
        }
    }

    /// Loyalty points earned by spending this amount.
    ///
    /// One point per [`LOYALTY_POINT_VALUE`] units, rounded down. The same
    /// rule is applied when a sale is committed and when it is reversed.
    #[inline]
    pub const fn loyalty_points(&self) -> i64 {
        if self.0 <= 0 {
            0
        } else {
            self.0 / LOYALTY_POINT_VALUE
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Debug-friendly rendering with thousands separators.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.0.unsigned_abs().to_string();
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }
        if self.0 < 0 {
            write!(f, "-{}", grouped)
        } else {
            write!(f, "{}", grouped)
        }
    }
}

impl From<i64> for Money {
    fn from(amount: i64) -> Self {
        Money(amount)
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Neg for Money {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + *m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::new(15_000).to_string(), "15,000");
        assert_eq!(Money::new(999).to_string(), "999");
        assert_eq!(Money::new(-1_250_000).to_string(), "-1,250,000");
        assert_eq!(Money::zero().to_string(), "0");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::new(1_000);
        let b = Money::new(400);

        assert_eq!((a + b).amount(), 1_400);
        assert_eq!((a - b).amount(), 600);
        assert_eq!((-a).amount(), -1_000);

        let total: Money = [a, b, b].iter().sum();
        assert_eq!(total.amount(), 1_800);
    }

    #[test]
    fn test_loyalty_points_round_down() {
        assert_eq!(Money::new(15_000).loyalty_points(), 15);
        assert_eq!(Money::new(15_999).loyalty_points(), 15);
        assert_eq!(Money::new(999).loyalty_points(), 0);
        assert_eq!(Money::new(-5_000).loyalty_points(), 0);
    }

    #[test]
    fn test_saturating_sub_floor() {
        let spent = Money::new(20_000);
        assert_eq!(spent.saturating_sub_floor(Money::new(5_000)).amount(), 15_000);
        assert_eq!(spent.saturating_sub_floor(Money::new(25_000)).amount(), 0);
    }

    #[test]
    fn test_serializes_as_bare_integer() {
        let json = serde_json::to_string(&Money::new(2_500)).unwrap();
        assert_eq!(json, "2500");
        let back: Money = serde_json::from_str("2500").unwrap();
        assert_eq!(back, Money::new(2_500));
    }
}
