//! Upstream work source.
//!
//! Turns node templates into jobs. A round runs when the node announces a new
//! block, when the block-wait timer fires, or when a session asks for work it
//! could not find cached. Each round fetches one template per payout address
//! that authorized sessions mine for, publishes it, and fans it out.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::NodeClient;
use crate::registry::JobRegistry;
use crate::session::SessionSet;
use crate::tracing::prelude::*;

/// Shortest allowed interval between timer-driven rounds.
pub const MIN_BLOCK_WAIT: Duration = Duration::from_millis(500);

/// Consecutive failures between error-level reports.
const FAILURE_REPORT_EVERY: u64 = 10;

/// Work source settings.
#[derive(Debug, Clone)]
pub struct WorkSourceConfig {
    /// Timer period; clamped to at least [`MIN_BLOCK_WAIT`]
    pub block_wait: Duration,

    /// Passed to the node as the coinbase extra data
    pub extra_data: String,
}

impl Default for WorkSourceConfig {
    fn default() -> Self {
        Self {
            block_wait: Duration::from_secs(1),
            extra_data: concat!("kaspa-bridge/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Why a round is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    NewBlock,
    Timer,
    Refresh,
}

/// Polls the node and publishes jobs.
pub struct WorkSource {
    node: Arc<dyn NodeClient>,
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionSet>,
    refresh: Arc<Notify>,
    config: WorkSourceConfig,
    consecutive_failures: u64,
}

impl WorkSource {
    pub fn new(
        node: Arc<dyn NodeClient>,
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionSet>,
        refresh: Arc<Notify>,
        config: WorkSourceConfig,
    ) -> Self {
        Self {
            node,
            registry,
            sessions,
            refresh,
            config,
            consecutive_failures: 0,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let block_wait = self.config.block_wait.max(MIN_BLOCK_WAIT);
        info!(block_wait_ms = block_wait.as_millis() as u64, "Work source starting");

        let mut new_blocks = self.node.new_block_notifications();
        let mut ticker = tokio::time::interval(block_wait);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let refresh = self.refresh.clone();

        loop {
            let trigger = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(()) = new_blocks.next() => Trigger::NewBlock,
                _ = ticker.tick() => Trigger::Timer,
                _ = refresh.notified() => Trigger::Refresh,
            };

            if trigger == Trigger::NewBlock {
                // A new block resets the timer so the next poll is a full
                // period away.
                ticker.reset();
            }

            self.round(trigger).await;
        }

        info!("Work source stopped");
    }

    /// Fetch, publish and broadcast one template per payout address.
    async fn round(&mut self, trigger: Trigger) {
        let payouts = self.sessions.payout_addresses();
        let released = self.registry.retain_payouts(&payouts);
        if released > 0 {
            debug!(jobs = released, "Released jobs of departed payout addresses");
        }
        if payouts.is_empty() {
            return;
        }

        let clean_jobs = trigger == Trigger::NewBlock;
        trace!(?trigger, payouts = payouts.len(), "Work round");

        for payout in payouts {
            let template = match self
                .node
                .get_block_template(&payout, &self.config.extra_data)
                .await
            {
                Ok(template) => template,
                Err(e) => {
                    self.record_failure(&e);
                    continue;
                }
            };

            if self.consecutive_failures > 0 {
                info!(
                    failures = self.consecutive_failures,
                    "Node reachable again"
                );
                self.consecutive_failures = 0;
            }

            if !template.is_synced {
                warn!(payout = %payout, "Node is not synced, template not published");
                continue;
            }

            let job = self.registry.publish(template);
            let sent = self.sessions.broadcast(&job, clean_jobs);
            debug!(job_id = job.id, payout = %job.payout, sessions = sent, clean_jobs, "Job published");
        }
    }

    fn record_failure(&mut self, error: &super::NodeError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures % FAILURE_REPORT_EVERY == 0 {
            error!(
                failures = self.consecutive_failures,
                error = %error,
                "Node keeps failing to provide templates"
            );
        } else {
            warn!(error = %error, "Failed to fetch block template");
        }
    }
}
