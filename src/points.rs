use serde::{Deserialize, Serialize};
use std::fmt;

/// Whole number of campus points. Balances and ledger amounts never go below zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Points(u64);

impl Points {
    pub const ZERO: Points = Points(0);

    pub fn new(value: u64) -> Self {
        Points(value)
    }

    /// Accepts a request amount only if it is strictly positive.
    pub fn positive(value: i64) -> Option<Self> {
        u64::try_from(value).ok().filter(|v| *v > 0).map(Points)
    }

    /// Accepts a target balance, which may be zero.
    pub fn non_negative(value: i64) -> Option<Self> {
        u64::try_from(value).ok().map(Points)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Points) -> Option<Points> {
        self.0.checked_add(rhs.0).map(Points)
    }

    pub fn checked_sub(self, rhs: Points) -> Option<Points> {
        self.0.checked_sub(rhs.0).map(Points)
    }

    pub fn checked_mul(self, factor: u32) -> Option<Points> {
        self.0.checked_mul(u64::from(factor)).map(Points)
    }

    /// Absolute difference, used for balance resets.
    pub fn abs_diff(self, other: Points) -> Points {
        Points(self.0.abs_diff(other.0))
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum for Points {
    fn sum<I: Iterator<Item = Points>>(iter: I) -> Self {
        Points(iter.map(|p| p.0).sum())
    }
}
