//! API client library.
//!
//! A Rust client for the bridge's HTTP API, used by the CLI binary.

use anyhow::{Context, Result};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;

use crate::api::ErrorResponse;
use crate::node::NodeInfo;
use crate::stats::StatsSnapshot;

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5556";

/// HTTP client for the bridge API.
pub struct Client {
    http: HttpClient,
    base_url: String,
}

impl Client {
    /// Create a client connecting to a specific base URL.
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the bridge counters.
    pub async fn get_stats(&self) -> Result<StatsSnapshot> {
        self.get("stats").await
    }

    /// Fetch the upstream node's status as seen by the bridge.
    pub async fn get_node(&self) -> Result<NodeInfo> {
        self.get("node").await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}/api/v1/{}", self.base_url, endpoint);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to connect to bridge API")?;

        let status = response.status();
        if !status.is_success() {
            // Prefer the server's own explanation when it sent one.
            match response.json::<ErrorResponse>().await {
                Ok(body) => anyhow::bail!("API request failed: {}: {}", status, body.error),
                Err(_) => anyhow::bail!("API request failed: {}", status),
            }
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))
    }
}
