//! Share validation and block submission.
//!
//! A share is checked in a fixed order: the job must still be known and pay
//! to the session's payout address, the nonce must carry the session's
//! extranonce, the (job, nonce) pair must be new, and the PoW value must meet
//! the session's share target. Shares that also meet the network target are
//! submitted to the node as blocks. Every outcome is audited through the
//! outbox; none of them ends the connection.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::node::{NodeClient, SubmitOutcome};
use crate::outbox::{now_rfc3339, EventKind, Outbox};
use crate::pow::{PowHasher, PowInput};
use crate::registry::{Job, JobRegistry};
use crate::session::extranonce::Extranonce;
use crate::session::{ClientSession, Identity};
use crate::stats::{BridgeStats, ShareCounter};
use crate::stratum::{ErrorCode, NONCE_SIZE};
use crate::tracing::prelude::*;

/// Why a share was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    StaleJob,
    DuplicateShare,
    LowDifficulty,
    InvalidNonce,
    Unauthorized,
}

impl RejectReason {
    /// Stratum error code sent to the miner.
    pub fn code(self) -> ErrorCode {
        match self {
            RejectReason::StaleJob => ErrorCode::JobNotFound,
            RejectReason::DuplicateShare => ErrorCode::DuplicateShare,
            RejectReason::LowDifficulty => ErrorCode::LowDifficulty,
            RejectReason::InvalidNonce => ErrorCode::Other,
            RejectReason::Unauthorized => ErrorCode::Unauthorized,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            RejectReason::StaleJob => "job not found",
            RejectReason::DuplicateShare => "duplicate share",
            RejectReason::LowDifficulty => "low difficulty share",
            RejectReason::InvalidNonce => "invalid nonce",
            RejectReason::Unauthorized => "unauthorized worker",
        }
    }

    fn audit_text(self) -> &'static str {
        match self {
            RejectReason::StaleJob => "stale",
            RejectReason::DuplicateShare => "duplicate",
            RejectReason::LowDifficulty => "low-difficulty",
            RejectReason::InvalidNonce => "invalid-nonce",
            RejectReason::Unauthorized => "unauthorized",
        }
    }

    fn counter(self) -> ShareCounter {
        match self {
            RejectReason::StaleJob => ShareCounter::Stale,
            RejectReason::DuplicateShare => ShareCounter::Duplicate,
            RejectReason::LowDifficulty => ShareCounter::LowDifficulty,
            RejectReason::InvalidNonce | RejectReason::Unauthorized => ShareCounter::Invalid,
        }
    }
}

/// What happened to a block candidate upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockResult {
    Accepted,
    Rejected(String),
    Failed(String),
}

impl BlockResult {
    fn audit_text(&self) -> String {
        match self {
            BlockResult::Accepted => "accepted".to_string(),
            BlockResult::Rejected(reason) => format!("rejected: {}", reason),
            BlockResult::Failed(error) => format!("error: {}", error),
        }
    }
}

/// Result of validating one share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Valid share; `block` is set when it was also a block candidate
    Accepted { block: Option<BlockResult> },
    Rejected(RejectReason),
}

/// (job, nonce) pairs a session has already submitted.
#[derive(Debug, Default)]
pub struct SubmissionLog {
    seen: BTreeMap<u64, HashSet<u64>>,
}

impl SubmissionLog {
    /// Record a submission. Returns false if it was already recorded.
    pub fn insert(&mut self, job_id: u64, nonce: u64) -> bool {
        self.seen.entry(job_id).or_default().insert(nonce)
    }

    /// Forget jobs for which `retained` is false.
    pub fn prune(&mut self, retained: impl Fn(u64) -> bool) {
        self.seen.retain(|job_id, _| retained(*job_id));
    }

    pub fn jobs(&self) -> usize {
        self.seen.len()
    }
}

/// Build the full 64-bit nonce from what the miner sent.
///
/// Miners that know about the extranonce send the whole nonce; the rest send
/// only their part, which goes below the extranonce. Returns `None` when the
/// nonce is not hex, too long, or carries someone else's extranonce.
pub fn build_nonce(raw: &str, extranonce: &Extranonce) -> Option<u64> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);

    if digits.is_empty() || digits.len() > NONCE_SIZE * 2 {
        return None;
    }
    let value = u64::from_str_radix(digits, 16).ok()?;

    let width = extranonce.size();
    if width == 0 {
        return Some(value);
    }

    let miner_bits = 64 - 8 * width as u32;
    let prefix = extranonce.value() as u64;
    if digits.len() <= (NONCE_SIZE - width) * 2 {
        Some((prefix << miner_bits) | value)
    } else if value >> miner_bits == prefix {
        Some(value)
    } else {
        None
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ShareRecord<'a> {
    current_time: String,
    ses_uid: &'a str,
    wallet_addr: &'a str,
    worker_name: &'a str,
    job_id: u64,
    nonce: String,
    difficulty: u64,
    outcome: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct BlockRecord<'a> {
    current_time: String,
    ses_uid: &'a str,
    wallet_addr: &'a str,
    worker_name: &'a str,
    job_id: u64,
    nonce: String,
    pay_addr: &'a str,
    outcome: String,
}

/// Validates shares and submits blocks.
pub struct ShareValidator {
    registry: Arc<JobRegistry>,
    node: Arc<dyn NodeClient>,
    hasher: Arc<dyn PowHasher>,
    outbox: Arc<Outbox>,
    stats: Arc<BridgeStats>,
}

impl ShareValidator {
    pub fn new(
        registry: Arc<JobRegistry>,
        node: Arc<dyn NodeClient>,
        hasher: Arc<dyn PowHasher>,
        outbox: Arc<Outbox>,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            registry,
            node,
            hasher,
            outbox,
            stats,
        }
    }

    /// Validate a share from `session`.
    pub async fn handle_submit(
        &self,
        session: &mut ClientSession,
        job_id: u64,
        raw_nonce: &str,
    ) -> ShareOutcome {
        let (outcome, nonce) = self.check(session, job_id, raw_nonce).await;

        let counter = match &outcome {
            ShareOutcome::Accepted { .. } => ShareCounter::Accepted,
            ShareOutcome::Rejected(reason) => reason.counter(),
        };
        self.stats.record_share(counter);

        if let Some(identity) = session.identity.as_ref() {
            let outcome_text = match &outcome {
                ShareOutcome::Accepted { block: None } => "accepted",
                ShareOutcome::Accepted { block: Some(_) } => "block",
                ShareOutcome::Rejected(reason) => reason.audit_text(),
            };
            let nonce_hex = match nonce {
                Some(n) => format!("{:016x}", n),
                None => raw_nonce.to_string(),
            };
            self.outbox.enqueue_json(
                EventKind::Share,
                &ShareRecord {
                    current_time: now_rfc3339(),
                    ses_uid: &identity.session_id,
                    wallet_addr: identity.wallet.as_str(),
                    worker_name: &identity.worker,
                    job_id,
                    nonce: nonce_hex,
                    difficulty: session.min_diff.value(),
                    outcome: outcome_text,
                },
            );
        }

        outcome
    }

    async fn check(
        &self,
        session: &mut ClientSession,
        job_id: u64,
        raw_nonce: &str,
    ) -> (ShareOutcome, Option<u64>) {
        let Some(identity) = session.identity.as_ref() else {
            return (ShareOutcome::Rejected(RejectReason::Unauthorized), None);
        };

        let job = match self.registry.get(job_id) {
            Ok(job) if job.payout == identity.payout => job,
            Ok(job) => {
                debug!(job_id, payout = %job.payout, "Share for another payout address");
                return (ShareOutcome::Rejected(RejectReason::StaleJob), None);
            }
            Err(e) => {
                debug!(error = %e, "Share for unknown job");
                return (ShareOutcome::Rejected(RejectReason::StaleJob), None);
            }
        };

        let Some(nonce) = build_nonce(raw_nonce, &session.extranonce) else {
            debug!(job_id, nonce = raw_nonce, extranonce = %session.extranonce, "Invalid nonce");
            return (ShareOutcome::Rejected(RejectReason::InvalidNonce), None);
        };

        let registry = &self.registry;
        session.submissions.prune(|id| registry.is_retained(id));
        if !session.submissions.insert(job_id, nonce) {
            return (
                ShareOutcome::Rejected(RejectReason::DuplicateShare),
                Some(nonce),
            );
        }

        let pow_value = self.hasher.pow_value(PowInput {
            pre_pow_hash: &job.pre_pow_hash,
            timestamp: job.timestamp,
            nonce,
        });

        if !session.min_diff.to_target().is_met_by(pow_value) {
            return (
                ShareOutcome::Rejected(RejectReason::LowDifficulty),
                Some(nonce),
            );
        }

        if !job.network_target().is_met_by(pow_value) {
            return (ShareOutcome::Accepted { block: None }, Some(nonce));
        }

        info!(
            job_id,
            nonce = format!("{:016x}", nonce),
            wallet = %identity.wallet,
            worker = %identity.worker,
            "Block candidate found"
        );
        let block = self.submit_block(&job, nonce, identity).await;
        (ShareOutcome::Accepted { block: Some(block) }, Some(nonce))
    }

    async fn submit_block(
        &self,
        job: &Job,
        nonce: u64,
        identity: &Identity,
    ) -> BlockResult {
        let result = match self.node.submit_block(job, nonce).await {
            Ok(SubmitOutcome::Accepted) => {
                info!(job_id = job.id, "Block accepted by node");
                BlockResult::Accepted
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                warn!(job_id = job.id, reason = %reason, "Block rejected by node");
                BlockResult::Rejected(reason)
            }
            Err(e) => {
                error!(job_id = job.id, error = %e, "Block submission failed");
                BlockResult::Failed(e.to_string())
            }
        };

        self.stats
            .record_block(matches!(result, BlockResult::Accepted));
        self.outbox.enqueue_json(
            EventKind::Block,
            &BlockRecord {
                current_time: now_rfc3339(),
                ses_uid: &identity.session_id,
                wallet_addr: identity.wallet.as_str(),
                worker_name: &identity.worker,
                job_id: job.id,
                nonce: format!("{:016x}", nonce),
                pay_addr: job.payout.as_str(),
                outcome: result.audit_text(),
            },
        );

        result
    }
}
