//! Stratum listener.
//!
//! Accepts miner connections and hands each one to its own
//! [`SessionHandler`] task. Sessions are tracked so shutdown can wait for
//! them to finish their teardown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::session::{SessionContext, SessionHandler};
use crate::stratum::Connection;
use crate::tracing::prelude::*;

/// The miner-facing TCP server.
pub struct StratumServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
}

impl StratumServer {
    /// Bind the listen address. A bind failure is fatal at startup.
    pub async fn bind(addr: &str, ctx: Arc<SessionContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled, then wait for every
    /// session task to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "Stratum server listening"),
            Err(e) => warn!(error = %e, "Stratum server listening on unknown address"),
        }

        let sessions = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Usually descriptor exhaustion; the next accept may
                    // succeed once sessions close.
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%remote_addr, error = %e, "Failed to set TCP_NODELAY");
            }

            debug!(%remote_addr, "Miner connected");
            let handler = SessionHandler::new(
                Connection::new(stream),
                remote_addr,
                self.ctx.clone(),
                shutdown.child_token(),
            );
            sessions.spawn(handler.run());
        }

        sessions.close();
        debug!(remaining = sessions.len(), "Waiting for sessions to close");
        sessions.wait().await;
        info!("Stratum server stopped");
    }
}
