//! API version 1 endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::node::NodeClient;
use crate::outbox::Outbox;
use crate::registry::JobRegistry;
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::tracing::prelude::*;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub stats: Arc<BridgeStats>,
    pub registry: Arc<JobRegistry>,
    pub outbox: Arc<Outbox>,
    pub node: Arc<dyn NodeClient>,
}

impl ApiState {
    /// Counters plus the gauges owned by the registry and outbox.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats
            .snapshot(self.registry.issued(), self.outbox.pending() as u64)
    }
}

/// API error response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check endpoint handler.
async fn health() -> &'static str {
    "OK"
}

/// Bridge statistics.
///
/// # Example
/// ```bash
/// curl http://localhost:5556/api/v1/stats
/// ```
async fn stats(State(state): State<ApiState>) -> Json<StatsSnapshot> {
    Json(state.snapshot())
}

/// The upstream node's version and sync state. Answers 502 when the node
/// cannot be reached.
async fn node(State(state): State<ApiState>) -> Response {
    match state.node.get_info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => {
            warn!(error = %e, "Node info request failed");
            let error = ErrorResponse {
                error: format!("node unavailable: {e}"),
            };
            (StatusCode::BAD_GATEWAY, Json(error)).into_response()
        }
    }
}

/// Build the v1 API routes.
pub fn routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/node", get(node))
        .with_state(state)
}
