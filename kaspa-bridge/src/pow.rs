//! Proof-of-work value computation.
//!
//! The bridge does not implement the node's consensus hashing. Share
//! validation goes through the [`PowHasher`] trait so the daemon can plug in
//! whatever function matches the node the bridge fronts, and tests can supply
//! exact values to probe the difficulty boundaries.

use sha2::{Digest, Sha256};

use crate::u256::U256;

/// Header fields a PoW function consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowInput<'a> {
    /// Hash of the block header with nonce and timestamp zeroed.
    pub pre_pow_hash: &'a [u8; 32],

    /// Header timestamp in milliseconds.
    pub timestamp: u64,

    /// Full 64-bit nonce, extranonce included.
    pub nonce: u64,
}

/// Computes the PoW value of a candidate header.
///
/// Smaller values are better; a share meets a target when its value is less
/// than or equal to the target.
pub trait PowHasher: Send + Sync {
    fn pow_value(&self, input: PowInput<'_>) -> U256;
}

/// Double SHA-256 over `pre_pow_hash || timestamp_le || nonce_le`.
///
/// The digest is read as a little-endian 256-bit integer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoubleSha256;

impl PowHasher for DoubleSha256 {
    fn pow_value(&self, input: PowInput<'_>) -> U256 {
        let mut hasher = Sha256::new();
        hasher.update(input.pre_pow_hash);
        hasher.update(input.timestamp.to_le_bytes());
        hasher.update(input.nonce.to_le_bytes());
        let first = hasher.finalize();
        let second = Sha256::digest(first);
        U256::from_le_bytes(second.into())
    }
}
