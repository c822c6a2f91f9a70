//! Miner identity parsing.
//!
//! Miners authorize with `"<address>[.<worker>]"`. The address is checked
//! against the Kaspa address format: a network prefix, a colon, and a bech32
//! payload. Addresses sent without a prefix are assumed to be mainnet.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Network prefix assumed when the miner omits one.
pub const DEFAULT_PREFIX: &str = "kaspa";

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(kaspa|kaspatest|kaspasim|kaspadev):[qpzry9x8gf2tvdw0s3jn54khce6mua7l]{61,63}$")
        .expect("address regex is valid")
});

/// Errors from parsing a miner identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("empty wallet address")]
    Empty,

    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),
}

/// A validated Kaspa address, lowercase with its network prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletAddress(String);

impl WalletAddress {
    /// Parse and normalize an address.
    pub fn parse(raw: &str) -> Result<Self, WalletError> {
        let raw = raw.trim().to_lowercase();
        if raw.is_empty() {
            return Err(WalletError::Empty);
        }

        let candidate = if raw.contains(':') {
            raw
        } else {
            format!("{}:{}", DEFAULT_PREFIX, raw)
        };

        if ADDRESS_RE.is_match(&candidate) {
            Ok(Self(candidate))
        } else {
            Err(WalletError::InvalidAddress(candidate))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Split a `mining.authorize` username into address and worker name.
///
/// The worker is everything after the first `.`; it may be empty.
pub fn parse_identity(username: &str) -> Result<(WalletAddress, String), WalletError> {
    let (address, worker) = match username.split_once('.') {
        Some((address, worker)) => (address, worker.to_string()),
        None => (username, String::new()),
    };
    Ok((WalletAddress::parse(address)?, worker))
}
