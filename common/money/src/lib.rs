use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use bigdecimal::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Normalize a monetary value to 2 decimal places, rounding half away from zero.
pub fn normalize_scale(value: &BigDecimal) -> BigDecimal {
    let half_cent = BigDecimal::from(5) / BigDecimal::from(1000);
    // with_scale truncates toward zero, so shift by half a cent in the value's direction first.
    if value < &BigDecimal::from(0) {
        (value.clone() - half_cent).with_scale(2)
    } else {
        (value.clone() + half_cent).with_scale(2)
    }
}

/// Compare two monetary values allowing a tolerance (in cents) after normalization.
pub fn nearly_equal(a: &BigDecimal, b: &BigDecimal, cents_tolerance: i64) -> bool {
    let diff = normalize_scale(a) - normalize_scale(b);
    let cents = (diff * BigDecimal::from(100)).with_scale(0);
    match cents.to_i64() {
        Some(c) => c.abs() <= cents_tolerance,
        None => false,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid monetary amount '{0}'")]
pub struct MoneyParseError(pub String);

/// Amount in the store currency, always held at 2 decimal places.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "BigDecimal", into = "BigDecimal")]
pub struct Money(BigDecimal);

impl Money {
    pub fn new(raw: BigDecimal) -> Self {
        Self(normalize_scale(&raw))
    }

    pub fn zero() -> Self {
        Self::from_cents(0)
    }

    pub fn from_cents(cents: i64) -> Self {
        Self::new(BigDecimal::from(cents) / BigDecimal::from(100))
    }

    pub fn to_cents(&self) -> Option<i64> {
        (self.0.clone() * BigDecimal::from(100)).with_scale(0).to_i64()
    }

    pub fn inner(&self) -> &BigDecimal {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < BigDecimal::from(0)
    }

    pub fn times(&self, quantity: u32) -> Money {
        Money::new(self.0.clone() * BigDecimal::from(quantity))
    }

    /// True when both amounts agree to within `cents_tolerance`.
    pub fn nearly_equals(&self, other: &Money, cents_tolerance: i64) -> bool {
        nearly_equal(&self.0, &other.0, cents_tolerance)
    }
}

impl From<BigDecimal> for Money {
    fn from(value: BigDecimal) -> Self {
        Self::new(value)
    }
}

impl From<Money> for BigDecimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigDecimal::from_str(s.trim())
            .map(Money::new)
            .map_err(|_| MoneyParseError(s.to_string()))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money::new(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Money> for Money {
    type Output = Money;

    fn add(self, rhs: &'a Money) -> Money {
        Money::new(self.0 + rhs.0.clone())
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}
