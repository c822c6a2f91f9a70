//! HTTP API server.
//!
//! A small read-only REST API for monitoring a running bridge: counters from
//! [`BridgeStats`](crate::stats::BridgeStats) and the upstream node's status.
//! Built on Axum. There is no authentication, so the listen address should
//! normally stay on localhost.

mod v1;

pub use v1::{ApiState, ErrorResponse};

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::tracing::prelude::*;

/// Serve on an already bound listener until `shutdown` is cancelled.
pub async fn serve_on(
    listener: TcpListener,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<()> {
    let actual_addr = listener.local_addr()?;
    info!(url = %format!("http://{}", actual_addr), "API server listening.");

    if !actual_addr.ip().is_loopback() {
        warn!(
            "API server is bound to a non-localhost address ({}). \
             This exposes bridge statistics to the network without authentication.",
            actual_addr.ip()
        );
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    info!("API server stopped.");
    Ok(())
}

fn build_router(state: ApiState) -> Router {
    Router::new().nest("/api/v1", v1::routes(state)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    )
}
