//! Integer share difficulty.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Target;

/// Integer mining difficulty.
///
/// Stratum communicates difficulty to miners as a plain number
/// (`mining.set_difficulty`). For validation, convert to a [`Target`] via
/// [`Difficulty::to_target`]; a PoW value meets the difficulty when it is
/// numerically less than or equal to that target.
///
/// ```text
/// target = MAX_TARGET / difficulty
/// ```
///
/// Difficulty 1 corresponds to [`Target::MAX`]. Higher difficulty yields a
/// smaller target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(u64);

impl Difficulty {
    /// Difficulty 1, the easiest share.
    pub const ONE: Self = Self(1);

    /// Create a new difficulty value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw integer value.
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Convert difficulty to a share target.
    ///
    /// Difficulty 0 is treated as 1.
    pub fn to_target(self) -> Target {
        if self.0 <= 1 {
            return Target::MAX;
        }
        Target::from(Target::MAX.as_u256() / self.0)
    }
}

impl From<Difficulty> for u64 {
    fn from(diff: Difficulty) -> Self {
        diff.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0 as f64;

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            return write!(f, "{}", self.0);
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}
