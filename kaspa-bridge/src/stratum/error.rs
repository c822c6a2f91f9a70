//! Error types for the Stratum transport and protocol.

use thiserror::Error;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line exceeded the framing limit
    #[error("Line too long")]
    LineTooLong,

    /// Invalid message received from a miner
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Missing or mistyped request parameter
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,
}

impl StratumError {
    /// Whether the connection can keep serving after this error.
    ///
    /// A garbled line does not poison the framing, so the session logs it
    /// and reads on. Anything else ends the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StratumError::InvalidMessage(_) | StratumError::InvalidParams(_)
        )
    }
}

impl From<tokio_util::codec::LinesCodecError> for StratumError {
    fn from(e: tokio_util::codec::LinesCodecError) -> Self {
        match e {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => StratumError::LineTooLong,
            tokio_util::codec::LinesCodecError::Io(e) => StratumError::Io(e),
        }
    }
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;
