//! Value Objects for the shop domain

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Ruble amount with kopeck precision.
///
/// Every arithmetic result that leaves this type is rounded half-up
/// (away from zero at the midpoint) to 2 decimal places.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self { Self(round_half_up(amount)) }
    pub fn from_rubles(rubles: i64) -> Self { Self(Decimal::from(rubles)) }
    pub fn amount(&self) -> Decimal { self.0 }
    pub fn is_negative(&self) -> bool { self.0.is_sign_negative() && !self.0.is_zero() }

    pub fn multiply(&self, qty: u32) -> Money { Money::new(self.0 * Decimal::from(qty)) }

    /// `self · pct / 100`, rounded.
    pub fn percent(&self, pct: Percent) -> Money {
        Money::new(self.0 * pct.value() / Decimal::ONE_HUNDRED)
    }

    /// `self · (100 − pct) / 100`, rounded.
    pub fn discounted(&self, pct: Percent) -> Money {
        Money::new(self.0 * (Decimal::ONE_HUNDRED - pct.value()) / Decimal::ONE_HUNDRED)
    }

    /// Whole rubles, rounded half-up. Used where upstreams want integers.
    pub fn whole_rubles(&self) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or_default()
    }

    /// Fixed two-decimal rendering, as payment providers expect (`"1195.00"`).
    pub fn to_fixed(&self) -> String { format!("{:.2}", self.0) }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self { Money::new(value) }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money { Money(self.0 + rhs.0) }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) { self.0 += rhs.0; }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money { Money(self.0 - rhs.0) }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money { iter.fold(Money::ZERO, |a, b| a + b) }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:.2} ₽", self.0) }
}

pub fn round_half_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Percentage in `[0, 100]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "Decimal", into = "Decimal")]
#[sqlx(transparent)]
pub struct Percent(Decimal);

impl Percent {
    pub const ZERO: Percent = Percent(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, PercentError> {
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
            return Err(PercentError::OutOfRange(value));
        }
        Ok(Self(round_half_up(value)))
    }
    pub fn value(&self) -> Decimal { self.0 }
}

impl TryFrom<Decimal> for Percent {
    type Error = PercentError;
    fn try_from(value: Decimal) -> Result<Self, Self::Error> { Percent::new(value) }
}

impl From<Percent> for Decimal {
    fn from(value: Percent) -> Decimal { value.0 }
}

#[derive(Debug, Clone, PartialEq)] pub enum PercentError { OutOfRange(Decimal) }
impl std::error::Error for PercentError {}
impl fmt::Display for PercentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Self::OutOfRange(v) => write!(f, "percent {} outside [0, 100]", v) }
    }
}

/// Line quantity, never below one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Result<Self, QuantityError> {
        if value == 0 { return Err(QuantityError::Zero); }
        Ok(Self(value))
    }
    pub fn value(&self) -> u32 { self.0 }
    pub fn add(&self, other: Quantity) -> Self { Self(self.0.saturating_add(other.0)) }
}

impl TryFrom<u32> for Quantity {
    type Error = QuantityError;
    fn try_from(value: u32) -> Result<Self, Self::Error> { Quantity::new(value) }
}

impl From<Quantity> for u32 {
    fn from(value: Quantity) -> u32 { value.0 }
}

#[derive(Debug, Clone, PartialEq)] pub enum QuantityError { Zero }
impl std::error::Error for QuantityError {}
impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "quantity must be at least 1") }
}
