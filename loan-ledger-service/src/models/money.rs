//! Integer money in minor currency units.
//!
//! Every amount in the ledger is a whole number of cents. Decimal strings only
//! appear at the edge (payment network payloads) and are converted once, here.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

use crate::error::LedgerError;

/// Amount in minor currency units (cents).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    pub fn max(self, other: Money) -> Money {
        Money(self.0.max(other.0))
    }

    /// `self - other`, floored at zero.
    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0).max(0))
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    /// floor(amount * rate_bps * periods / 10_000).
    pub fn apply_bps(self, rate_bps: i32, periods: i32) -> Option<Money> {
        let scaled = (self.0 as i128)
            .checked_mul(rate_bps as i128)?
            .checked_mul(periods as i128)?
            / 10_000;
        i64::try_from(scaled).ok().map(Money)
    }

    /// Split into `parts` equal floored shares. Returns (share, remainder).
    pub fn split_floor(self, parts: i32) -> Option<(Money, Money)> {
        if parts <= 0 {
            return None;
        }
        let parts = parts as i64;
        Some((Money(self.0 / parts), Money(self.0 % parts)))
    }

    /// Parse a major-unit decimal string ("3000", "3000.5", "3000.50") into cents.
    pub fn parse_decimal(raw: &str) -> Result<Money, LedgerError> {
        let trimmed = raw.trim();
        let value = Decimal::from_str(trimmed).map_err(|_| {
            LedgerError::InvalidAmount(format!("'{}' is not a decimal amount", trimmed))
        })?;

        if value.is_sign_negative() {
            return Err(LedgerError::InvalidAmount(format!(
                "'{}' is negative",
                trimmed
            )));
        }
        if value.normalize().scale() > 2 {
            return Err(LedgerError::InvalidAmount(format!(
                "'{}' has more than two decimal places",
                trimmed
            )));
        }

        let cents = value
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|c| c.to_i64())
            .ok_or_else(|| LedgerError::InvalidAmount(format!("'{}' is out of range", trimmed)))?;

        Ok(Money(cents))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}
