//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` to provide the handful of operations the
//! share validator needs: byte conversions, division by a difficulty, a left
//! shift for compact target decoding, and ordering for target comparisons.

use ruint::aliases::U256 as Ruint256;
use std::fmt;
use std::ops::{Div, Shl};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// One constant.
    pub const ONE: Self = Self(Ruint256::from_limbs([1, 0, 0, 0]));

    /// `2^224 - 1`, the difficulty-1 share target.
    ///
    /// Limbs are little-endian: three full limbs plus the low half of the
    /// fourth.
    pub const DIFF1: Self = Self(Ruint256::from_limbs([u64::MAX, u64::MAX, u64::MAX, 0xffff_ffff]));

    /// Largest representable value.
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    /// Convert to big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn saturating_to_u64(self) -> u64 {
        self.0.saturating_to()
    }

    /// Add one, saturating at `MAX`.
    pub fn saturating_add_one(self) -> Self {
        Self(self.0.saturating_add(Ruint256::from(1u64)))
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

impl Shl<usize> for U256 {
    type Output = Self;

    fn shl(self, rhs: usize) -> Self::Output {
        Self(self.0 << rhs)
    }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_be_bytes()))
    }
}
