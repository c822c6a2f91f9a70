//! Node client over the HTTP RPC shim.
//!
//! The shim maps one path per RPC (`/GetInfo`, `/GetBlockDAGInfo`, ...) and
//! answers with the node's response as JSON, or `{"error": "..."}` when the
//! call failed.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::IntervalStream;

use super::{BlockTemplate, NodeClient, NodeError, NodeInfo, SubmitOutcome};
use crate::registry::Job;
use crate::tracing::prelude::*;
use crate::wallet::WalletAddress;

/// How often the tip is polled to detect new blocks.
const TIP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateResponse {
    block: Value,
    pre_pow_hash: String,
    timestamp: u64,
    bits: u32,
    #[serde(default)]
    is_synced: bool,
}

#[derive(Deserialize)]
struct SubmitResponse {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DagInfo {
    #[serde(alias = "TipHashes", default)]
    tip_hashes: Vec<String>,
}

/// HTTP client for the node RPC shim.
#[derive(Clone)]
pub struct HttpNodeClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, rpc: &str) -> String {
        format!("{}/{}", self.base_url, rpc)
    }
}

/// Decode a shim response, surfacing its `{"error": ...}` form.
fn decode<T: DeserializeOwned>(value: Value) -> Result<T, NodeError> {
    if let Some(msg) = value.get("error").and_then(Value::as_str) {
        if !msg.is_empty() {
            return Err(NodeError::Rpc(msg.to_string()));
        }
    }
    serde_json::from_value(value).map_err(|e| NodeError::InvalidResponse(e.to_string()))
}

async fn get_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T, NodeError> {
    let value: Value = request.send().await?.error_for_status()?.json().await?;
    decode(value)
}

fn parse_pre_pow_hash(hex_str: &str) -> Result<[u8; 32], NodeError> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut hash)
        .map_err(|e| NodeError::InvalidResponse(format!("prePowHash: {}", e)))?;
    Ok(hash)
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn get_block_template(
        &self,
        pay_address: &WalletAddress,
        extra_data: &str,
    ) -> Result<BlockTemplate, NodeError> {
        let request = self
            .client
            .get(self.endpoint("GetBlockTemplate"))
            .query(&[("payAddress", pay_address.as_str()), ("extraData", extra_data)]);
        let response: TemplateResponse = get_json(request).await?;

        Ok(BlockTemplate {
            pre_pow_hash: parse_pre_pow_hash(&response.pre_pow_hash)?,
            block: response.block,
            timestamp: response.timestamp,
            bits: response.bits,
            is_synced: response.is_synced,
            pay_address: pay_address.clone(),
        })
    }

    async fn submit_block(&self, job: &Job, nonce: u64) -> Result<SubmitOutcome, NodeError> {
        let request = self
            .client
            .post(self.endpoint("SubmitBlock"))
            .json(&json!({ "block": job.block, "nonce": nonce }));
        let response: SubmitResponse = get_json(request).await?;

        if response.accepted {
            Ok(SubmitOutcome::Accepted)
        } else {
            Ok(SubmitOutcome::Rejected(
                response.reason.unwrap_or_else(|| "rejected".to_string()),
            ))
        }
    }

    async fn get_info(&self) -> Result<NodeInfo, NodeError> {
        get_json(self.client.get(self.endpoint("GetInfo"))).await
    }

    fn new_block_notifications(&self) -> BoxStream<'static, ()> {
        let client = self.client.clone();
        let url = self.endpoint("GetBlockDAGInfo");

        let mut ticks = tokio::time::interval(TIP_POLL_INTERVAL);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_tips: Option<Vec<String>> = None;

        IntervalStream::new(ticks)
            .then(move |_| {
                let request = client.get(url.clone());
                async move { get_json::<DagInfo>(request).await }
            })
            .filter_map(move |result| {
                let signal = match result {
                    Ok(info) => {
                        let changed = last_tips
                            .as_ref()
                            .is_some_and(|last| *last != info.tip_hashes);
                        last_tips = Some(info.tip_hashes);
                        changed.then_some(())
                    }
                    Err(e) => {
                        debug!(error = %e, "Tip poll failed");
                        None
                    }
                };
                futures::future::ready(signal)
            })
            .boxed()
    }
}
