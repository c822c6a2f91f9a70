//! Upstream node access.
//!
//! The bridge never talks consensus itself. It asks a node for block
//! templates, hands back solved blocks, and watches for new tips. The
//! [`NodeClient`] trait is the seam: [`HttpNodeClient`] reaches a real node
//! through its HTTP RPC shim, and tests substitute a scripted client.
//!
//! [`WorkSource`] is the task that turns node output into jobs.

mod http;
mod work_source;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::Job;
use crate::wallet::WalletAddress;

pub use http::HttpNodeClient;
pub use work_source::{WorkSource, WorkSourceConfig, MIN_BLOCK_WAIT};

/// Errors talking to the node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Transport-level failure reaching the shim
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The shim answered with an error object
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The answer did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A block template, ready to become a job.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockTemplate {
    /// The node's block, kept verbatim for submission
    pub block: Value,

    /// Hash of the header with nonce and timestamp zeroed
    pub pre_pow_hash: [u8; 32],

    /// Header timestamp in milliseconds
    pub timestamp: u64,

    /// Compact network target
    pub bits: u32,

    /// Whether the node considers itself synced
    pub is_synced: bool,

    /// Address the coinbase pays to
    pub pay_address: WalletAddress,
}

/// Node identification and sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    #[serde(alias = "ServerVersion", default)]
    pub server_version: String,

    #[serde(alias = "IsSynced", default)]
    pub is_synced: bool,

    #[serde(alias = "TipHash", default, skip_serializing_if = "Option::is_none")]
    pub tip_hash: Option<String>,
}

/// What the node said about a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Operations the bridge needs from a node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch a template paying to `pay_address`.
    async fn get_block_template(
        &self,
        pay_address: &WalletAddress,
        extra_data: &str,
    ) -> Result<BlockTemplate, NodeError>;

    /// Submit a job's block with the winning nonce.
    async fn submit_block(&self, job: &Job, nonce: u64) -> Result<SubmitOutcome, NodeError>;

    /// Node identification and sync status.
    async fn get_info(&self) -> Result<NodeInfo, NodeError>;

    /// A stream that yields once per new block the node learns about.
    fn new_block_notifications(&self) -> BoxStream<'static, ()>;
}

/// Scripted node client for tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Serves templates built from a counter and records submissions.
    pub struct MockNode {
        pub fail_templates: Mutex<bool>,
        pub synced: Mutex<bool>,
        pub submit_outcomes: Mutex<VecDeque<Result<SubmitOutcome, String>>>,
        pub submitted: Mutex<Vec<(u64, u64)>>,
        pub template_requests: Mutex<Vec<WalletAddress>>,
        notify_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
        counter: Mutex<u64>,
    }

    impl MockNode {
        pub fn new() -> (Self, mpsc::UnboundedSender<()>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let node = Self {
                fail_templates: Mutex::new(false),
                synced: Mutex::new(true),
                submit_outcomes: Mutex::new(VecDeque::new()),
                submitted: Mutex::new(Vec::new()),
                template_requests: Mutex::new(Vec::new()),
                notify_rx: Mutex::new(Some(rx)),
                counter: Mutex::new(0),
            };
            (node, tx)
        }
    }

    /// A template with a distinguishable pre-PoW hash.
    pub fn template(pay_address: &WalletAddress, seed: u8, bits: u32) -> BlockTemplate {
        BlockTemplate {
            block: serde_json::json!({ "seed": seed }),
            pre_pow_hash: [seed; 32],
            timestamp: 1_700_000_000_000 + seed as u64,
            bits,
            is_synced: true,
            pay_address: pay_address.clone(),
        }
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn get_block_template(
            &self,
            pay_address: &WalletAddress,
            _extra_data: &str,
        ) -> Result<BlockTemplate, NodeError> {
            self.template_requests.lock().push(pay_address.clone());
            if *self.fail_templates.lock() {
                return Err(NodeError::Rpc("node unavailable".into()));
            }
            let seed = {
                let mut counter = self.counter.lock();
                *counter += 1;
                *counter as u8
            };
            let mut t = template(pay_address, seed, 0x1e7fffff);
            t.is_synced = *self.synced.lock();
            Ok(t)
        }

        async fn submit_block(&self, job: &Job, nonce: u64) -> Result<SubmitOutcome, NodeError> {
            self.submitted.lock().push((job.id, nonce));
            match self.submit_outcomes.lock().pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(e)) => Err(NodeError::Rpc(e)),
                None => Ok(SubmitOutcome::Accepted),
            }
        }

        async fn get_info(&self) -> Result<NodeInfo, NodeError> {
            Ok(NodeInfo {
                server_version: "mock".into(),
                is_synced: *self.synced.lock(),
                tip_hash: None,
            })
        }

        fn new_block_notifications(&self) -> BoxStream<'static, ()> {
            use futures::StreamExt;
            match self.notify_rx.lock().take() {
                Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
                None => futures::stream::pending().boxed(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info_accepts_shim_casing() {
        let info: NodeInfo = serde_json::from_str(
            r#"{"P2PID":"x","MempoolSize":0,"ServerVersion":"0.12.17","IsUtxoIndexed":true,"IsSynced":true}"#,
        )
        .unwrap();
        assert_eq!(info.server_version, "0.12.17");
        assert!(info.is_synced);
        assert_eq!(info.tip_hash, None);
    }

    #[test]
    fn test_node_info_serializes_camel_case() {
        let info = NodeInfo {
            server_version: "1.0".into(),
            is_synced: false,
            tip_hash: Some("ab".into()),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"serverVersion": "1.0", "isSynced": false, "tipHash": "ab"})
        );
    }
}
