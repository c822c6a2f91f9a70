//! Miner sessions.
//!
//! One [`ClientSession`] exists per miner connection and walks through
//! `Connected → Subscribed → Authorized → Active`, ending in `Disconnected`.
//! Authorized sessions join the [`SessionSet`], which fans new jobs out to
//! them through bounded per-session queues.
//!
//! The per-connection task itself lives in [`handler`].

pub mod extranonce;
mod handler;

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::outbox::Outbox;
use crate::registry::{Job, JobRegistry};
use crate::share::{ShareValidator, SubmissionLog};
use crate::stats::BridgeStats;
use crate::stratum::JobFormat;
use crate::tracing::prelude::*;
use crate::types::Difficulty;
use crate::wallet::WalletAddress;

use extranonce::{Extranonce, ExtranonceAllocator};

pub use handler::SessionHandler;

/// Jobs a session may have queued before further jobs are dropped for it.
pub const JOB_QUEUE_DEPTH: usize = 16;

/// Where a session is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Subscribed,
    Authorized,
    Active,
    Disconnected,
}

/// Who a session mines for, fixed at authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Random id, 32 hex characters
    pub session_id: String,

    pub wallet: WalletAddress,

    pub worker: String,

    /// Kept for the audit trail only
    pub password: String,

    /// Address templates for this session pay to
    pub payout: WalletAddress,
}

/// Per-connection state.
#[derive(Debug)]
pub struct ClientSession {
    /// Connection key in the session set
    pub conn_id: u64,

    pub remote_addr: SocketAddr,

    /// Miner software string from `mining.subscribe`
    pub remote_app: String,

    pub state: SessionState,

    /// Set once authorized
    pub identity: Option<Identity>,

    pub extranonce: Extranonce,

    pub min_diff: Difficulty,

    /// Most recent job sent to the miner
    pub last_job_id: Option<u64>,

    pub job_format: JobFormat,

    pub submissions: SubmissionLog,
}

impl ClientSession {
    pub fn new(conn_id: u64, remote_addr: SocketAddr, min_diff: Difficulty) -> Self {
        Self {
            conn_id,
            remote_addr,
            remote_app: String::new(),
            state: SessionState::Connected,
            identity: None,
            extranonce: Extranonce::EMPTY,
            min_diff,
            last_job_id: None,
            job_format: JobFormat::Words,
            submissions: SubmissionLog::default(),
        }
    }

    /// Whether the miner may submit shares.
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// A job on its way to one session.
#[derive(Debug, Clone)]
pub struct JobDispatch {
    pub job: Arc<Job>,
    pub clean_jobs: bool,
}

struct Member {
    payout: WalletAddress,
    jobs: mpsc::Sender<JobDispatch>,
}

/// Authorized sessions, keyed by connection id.
pub struct SessionSet {
    members: Mutex<HashMap<u64, Member>>,
    next_conn_id: AtomicU64,
    queue_depth: usize,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::with_queue_depth(JOB_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    /// A fresh connection id.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a session to the fan-out. Returns the receiving end of its job
    /// queue.
    pub fn register(&self, conn_id: u64, payout: WalletAddress) -> mpsc::Receiver<JobDispatch> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.members.lock().insert(conn_id, Member { payout, jobs: tx });
        rx
    }

    pub fn deregister(&self, conn_id: u64) {
        self.members.lock().remove(&conn_id);
    }

    /// Queue `job` for every session paying to its payout address.
    ///
    /// Returns the number of sessions the job was queued for. A session whose
    /// queue is full or closed is skipped.
    pub fn broadcast(&self, job: &Arc<Job>, clean_jobs: bool) -> usize {
        let targets: Vec<(u64, mpsc::Sender<JobDispatch>)> = self
            .members
            .lock()
            .iter()
            .filter(|(_, m)| m.payout == job.payout)
            .map(|(id, m)| (*id, m.jobs.clone()))
            .collect();

        let mut sent = 0;
        for (conn_id, tx) in targets {
            let dispatch = JobDispatch {
                job: job.clone(),
                clean_jobs,
            };
            match tx.try_send(dispatch) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn_id, job_id = job.id, "Session job queue full, skipping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(conn_id, job_id = job.id, "Session gone, skipping");
                }
            }
        }
        sent
    }

    /// Distinct payout addresses of registered sessions.
    pub fn payout_addresses(&self) -> Vec<WalletAddress> {
        self.members
            .lock()
            .values()
            .map(|m| m.payout.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a session task shares with the rest of the bridge.
pub struct SessionContext {
    pub registry: Arc<JobRegistry>,
    pub sessions: Arc<SessionSet>,
    pub extranonces: Arc<ExtranonceAllocator>,
    pub validator: Arc<ShareValidator>,
    pub outbox: Arc<Outbox>,
    pub stats: Arc<BridgeStats>,

    /// Wakes the work source when a session needs a job that is not cached
    pub refresh: Arc<Notify>,

    pub min_diff: Difficulty,

    /// Pays all templates to this address instead of each miner's own
    pub pool_wallet: Option<WalletAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::mock::template;
    use crate::wallet::test_addresses::{MINER_A, MINER_B};

    fn addr(s: &str) -> WalletAddress {
        WalletAddress::parse(s).unwrap()
    }

    #[test]
    fn test_broadcast_filters_by_payout() {
        let registry = JobRegistry::default();
        let set = SessionSet::new();
        let mut rx_a = set.register(1, addr(MINER_A));
        let mut rx_b = set.register(2, addr(MINER_B));

        let job = registry.publish(template(&addr(MINER_A), 1, 0x1d00ffff));
        assert_eq!(set.broadcast(&job, true), 1);

        let got = rx_a.try_recv().unwrap();
        assert_eq!(got.job.id, job.id);
        assert!(got.clean_jobs);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_skips_full_and_closed_queues() {
        let registry = JobRegistry::default();
        let set = SessionSet::with_queue_depth(1);
        let _full = set.register(1, addr(MINER_A));
        let closed = set.register(2, addr(MINER_A));
        drop(closed);

        let first = registry.publish(template(&addr(MINER_A), 1, 0x1d00ffff));
        assert_eq!(set.broadcast(&first, false), 1);

        let second = registry.publish(template(&addr(MINER_A), 2, 0x1d00ffff));
        assert_eq!(set.broadcast(&second, false), 0);
    }

    #[test]
    fn test_jobs_arrive_in_publish_order() {
        let registry = JobRegistry::default();
        let set = SessionSet::new();
        let mut rx = set.register(1, addr(MINER_A));

        let ids: Vec<u64> = (1..=5)
            .map(|i| {
                let job = registry.publish(template(&addr(MINER_A), i, 0x1d00ffff));
                set.broadcast(&job, false);
                job.id
            })
            .collect();

        let received: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok().map(|d| d.job.id)).collect();
        assert_eq!(received, ids);
    }

    #[test]
    fn test_payout_addresses_are_distinct() {
        let set = SessionSet::new();
        set.register(1, addr(MINER_A));
        set.register(2, addr(MINER_A));
        set.register(3, addr(MINER_B));
        assert_eq!(set.payout_addresses().len(), 2);

        set.deregister(3);
        assert_eq!(set.payout_addresses(), vec![addr(MINER_A)]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_conn_ids_unique() {
        let set = SessionSet::new();
        let a = set.next_conn_id();
        let b = set.next_conn_id();
        assert_ne!(a, b);
    }
}
