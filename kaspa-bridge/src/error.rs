//! Common error types for kaspa-bridge.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the per-component error types. Components return their
//! own narrower errors; configuration loading and the startup path work in
//! terms of this one.

use thiserror::Error;

use crate::node::NodeError;
use crate::outbox::BackendError;

/// Main error type for kaspa-bridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream node errors
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    /// Durable backend errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<ext_config::ConfigError> for Error {
    fn from(e: ext_config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
