//! Core types shared across the bridge.

mod difficulty;

pub use difficulty::Difficulty;

use std::fmt;

use crate::u256::U256;

/// A proof-of-work target.
///
/// A PoW value meets the target when `value <= target`. Share targets come
/// from a [`Difficulty`]; network targets are decoded from the compact `bits`
/// field of a block template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(U256);

impl Target {
    /// Difficulty-1 target, `2^224 - 1`.
    pub const MAX: Self = Self(U256::DIFF1);

    /// Decode a compact ("nBits") target.
    ///
    /// The top byte is a base-256 exponent and the low 23 bits a mantissa, so
    /// `target = mantissa * 256^(exponent - 3)`. A set sign bit or zero
    /// mantissa decodes to zero; values that do not fit in 256 bits saturate.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x007f_ffff;

        if mantissa == 0 || bits & 0x0080_0000 != 0 {
            return Self(U256::ZERO);
        }

        if exponent <= 3 {
            return Self(U256::from((mantissa >> (8 * (3 - exponent))) as u64));
        }

        let shift = 8 * (exponent - 3);
        let mantissa_bits = 32 - mantissa.leading_zeros() as usize;
        if shift + mantissa_bits > 256 {
            return Self(U256::MAX);
        }
        Self(U256::from(mantissa as u64) << shift)
    }

    /// Whether a PoW value meets this target.
    pub fn is_met_by(&self, pow_value: U256) -> bool {
        pow_value <= self.0
    }

    /// The target as a 256-bit integer.
    pub fn as_u256(&self) -> U256 {
        self.0
    }
}

impl From<U256> for Target {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
