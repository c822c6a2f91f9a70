//! Kaspa Stratum pool bridge.
//!
//! The bridge sits between a Kaspa node and a population of Stratum miners.
//! Block templates fetched from the node become jobs that are streamed to
//! authorized sessions; submitted shares are validated against each session's
//! difficulty, block candidates are forwarded to the node, and every
//! pool-significant occurrence is queued to a durable backend through the
//! outbox.
//!
//! Data flows through the crate like this:
//!
//! ```text
//! node ──template──> WorkSource ──publish──> JobRegistry
//!                        │
//!                        └──broadcast──> SessionSet ──notify──> miner
//!
//! miner ──submit──> session ──> ShareValidator ──block──> node
//!                      │              │
//!                      └──────────────┴──AuditEvent──> Outbox ──> backend
//!                                                         └──failure──> dead-letter file
//! ```

pub mod api;
pub mod api_client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod node;
pub mod outbox;
pub mod pow;
pub mod registry;
pub mod server;
pub mod session;
pub mod share;
pub mod stats;
pub mod stratum;
pub mod tracing;
pub mod types;
pub mod u256;
pub mod wallet;
