//! Stratum mining protocol, server side.
//!
//! Miners connect over TCP and speak newline-delimited JSON-RPC. The bridge
//! answers the subset Kaspa miners use:
//!
//! - **Miner requests**: `mining.subscribe`, `mining.authorize`,
//!   `mining.submit`, `mining.extranonce.subscribe`
//! - **Bridge notifications**: `mining.set_extranonce`,
//!   `mining.set_difficulty`, `mining.notify`
//! - **Bridge responses**: `true`/result on success, `[code, message, null]`
//!   on failure
//!
//! This module only knows the wire format and framing. Session state lives in
//! [`crate::session`].

mod connection;
mod error;
mod messages;

#[cfg(test)]
pub(crate) use connection::{MockTransport, MockTransportHandle};
pub use connection::{Connection, Transport, MAX_LINE_LENGTH};
pub use error::{StratumError, StratumResult};
pub use messages::{
    set_difficulty, set_extranonce, AuthorizeParams, ErrorCode, JobFormat, JobNotification,
    JsonRpcMessage, StratumMethod, SubmitParams, SubscribeParams, NONCE_SIZE, PROTOCOL_VERSION,
};
