//! Daemon lifecycle management for kaspa-bridge.
//!
//! This module wires the bridge together from its configuration, runs every
//! long-lived task on a tracker, and handles signals and graceful shutdown.
//!
//! Shutdown happens in two steps. The miner-facing side (listener, sessions,
//! work source, API) stops first so that disconnect events are queued while
//! the outbox drain is still running; the drain is stopped after that.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::api::{self, ApiState};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::node::{HttpNodeClient, NodeClient, WorkSource, WorkSourceConfig};
use crate::outbox::{DeadLetterWriter, DurableBackend, HttpBackend, Outbox};
use crate::pow::{DoubleSha256, PowHasher};
use crate::registry::JobRegistry;
use crate::server::StratumServer;
use crate::session::extranonce::ExtranonceAllocator;
use crate::session::{SessionContext, SessionSet};
use crate::share::ShareValidator;
use crate::stats::BridgeStats;
use crate::tracing::prelude::*;

/// The bridge process.
pub struct Daemon {
    config: BridgeConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a daemon from a validated configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Connect to the node and backend, then run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let (node, backend) = connect_upstreams(&self.config).await.with_context(|| {
            format!(
                "failed to reach backend ({})",
                self.config.redacted_backend_url()
            )
        })?;
        info!(url = %self.config.redacted_backend_url(), "Backend reachable");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let signals = async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        };

        self.run_with(Arc::new(node), Arc::new(backend), Arc::new(DoubleSha256), signals)
            .await
    }

    /// Run with the given collaborators until `stop` completes.
    pub async fn run_with(
        self,
        node: Arc<dyn NodeClient>,
        backend: Arc<dyn DurableBackend>,
        hasher: Arc<dyn PowHasher>,
        stop: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let config = &self.config;
        info!(
            stratum_listen = %config.stratum_listen,
            node_url = %config.node_url,
            backend_url = %config.redacted_backend_url(),
            coin = %config.coin,
            min_share_diff = config.min_share_diff,
            extranonce_size = config.extranonce_size,
            block_wait_ms = config.block_wait_ms,
            job_retention = config.job_retention,
            pool_wallet = config.pool_wallet.as_deref().unwrap_or("-"),
            api_listen = config.api_listen.as_deref().unwrap_or("-"),
            dead_letter_dir = %config.dead_letter_dir.display(),
            "Effective configuration"
        );

        match node.get_info().await {
            Ok(info) => {
                info!(version = %info.server_version, synced = info.is_synced, "Node reachable");
                if !info.is_synced {
                    warn!("Node is not synced; jobs will start once it is");
                }
            }
            Err(e) => warn!(error = %e, "Node not reachable yet; will keep polling"),
        }

        let pool_wallet = config.pool_wallet_address()?;
        let stats = Arc::new(BridgeStats::new());
        let registry = Arc::new(JobRegistry::new(config.job_retention));
        let outbox = Arc::new(Outbox::new(config.coin.clone(), stats.clone()));
        let sessions = Arc::new(SessionSet::new());
        let refresh = Arc::new(Notify::new());
        let validator = Arc::new(ShareValidator::new(
            registry.clone(),
            node.clone(),
            hasher,
            outbox.clone(),
            stats.clone(),
        ));

        let ctx = Arc::new(SessionContext {
            registry: registry.clone(),
            sessions: sessions.clone(),
            extranonces: Arc::new(ExtranonceAllocator::new(config.extranonce_size)),
            validator,
            outbox: outbox.clone(),
            stats: stats.clone(),
            refresh: refresh.clone(),
            min_diff: config.min_difficulty(),
            pool_wallet,
        });

        let server = StratumServer::bind(&config.stratum_listen, ctx)
            .await
            .with_context(|| format!("failed to listen on {}", config.stratum_listen))?;

        let api_listener = match &config.api_listen {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind API on {addr}"))?,
            ),
            None => None,
        };

        // The drain outlives the miner-facing tasks.
        let drain_shutdown = CancellationToken::new();
        let drain = tokio::spawn(outbox.clone().run_drain(
            backend,
            DeadLetterWriter::new(config.dead_letter_dir.clone()),
            config.outbox_interval(),
            drain_shutdown.clone(),
        ));

        let work_source = WorkSource::new(
            node.clone(),
            registry.clone(),
            sessions,
            refresh,
            WorkSourceConfig {
                block_wait: config.block_wait(),
                ..WorkSourceConfig::default()
            },
        );
        self.tracker.spawn(work_source.run(self.shutdown.clone()));
        self.tracker.spawn(server.run(self.shutdown.clone()));

        if let Some(listener) = api_listener {
            let state = ApiState {
                stats,
                registry,
                outbox: outbox.clone(),
                node,
            };
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                if let Err(e) = api::serve_on(listener, state, shutdown).await {
                    error!(error = %e, "API server failed");
                }
            });
        }
        self.tracker.close();

        info!("Started.");
        stop.await;

        trace!("Shutting down.");
        self.shutdown.cancel();
        self.tracker.wait().await;

        drain_shutdown.cancel();
        if let Err(e) = drain.await {
            error!(error = %e, "Outbox drain task failed");
        }

        info!(undelivered = outbox.pending(), "Exiting.");
        Ok(())
    }
}

/// Build the HTTP clients and make sure the backend answers.
///
/// The node is only asked for its status later, since it may still be syncing.
async fn connect_upstreams(config: &BridgeConfig) -> Result<(HttpNodeClient, HttpBackend)> {
    let node = HttpNodeClient::new(config.node_url.clone())?;
    let backend = HttpBackend::new(config.backend_url.clone())?;
    backend.health_check().await?;
    Ok((node, backend))
}
