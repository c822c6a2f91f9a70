//! Job registry.
//!
//! Every template published by the work source becomes a [`Job`] with a
//! bridge-wide identifier. The registry remembers the last few jobs per
//! payout address so shares for recent work can still be checked, and tells
//! apart ids that aged out (stale) from ids it never issued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use crate::node::BlockTemplate;
use crate::stratum::JobNotification;
use crate::types::Target;
use crate::wallet::WalletAddress;

/// Jobs kept per payout address unless configured otherwise.
pub const DEFAULT_RETENTION: usize = 8;

/// One unit of mineable work. Immutable once issued.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Bridge-wide identifier, strictly increasing
    pub id: u64,

    /// The node's block, kept verbatim for submission
    pub block: Value,

    /// Hash of the header with nonce and timestamp zeroed
    pub pre_pow_hash: [u8; 32],

    /// Header timestamp in milliseconds
    pub timestamp: u64,

    /// Compact network target
    pub bits: u32,

    /// Address the block pays to
    pub payout: WalletAddress,

    /// When the bridge issued the job
    pub created_at: SystemTime,
}

impl Job {
    /// Target a share must meet to be a block.
    pub fn network_target(&self) -> Target {
        Target::from_compact(self.bits)
    }

    /// The `mining.notify` content for this job.
    pub fn notification(&self, clean_jobs: bool) -> JobNotification {
        JobNotification {
            job_id: self.id,
            pre_pow_hash: self.pre_pow_hash,
            timestamp: self.timestamp,
            clean_jobs,
        }
    }
}

/// Why a job id could not be resolved.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLookupError {
    /// Issued, but pushed out of its retention window
    #[error("job {0} is stale")]
    Stale(u64),

    /// Never issued by this bridge instance
    #[error("job {0} not found")]
    NotFound(u64),
}

struct Inner {
    /// Last id handed out; 0 means none yet
    counter: u64,
    jobs: HashMap<u64, Arc<Job>>,
    windows: HashMap<WalletAddress, VecDeque<u64>>,
}

/// Issues job ids and retains recent jobs.
pub struct JobRegistry {
    retention: usize,
    inner: RwLock<Inner>,
}

impl JobRegistry {
    /// Create a registry keeping `retention` jobs per payout address.
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            inner: RwLock::new(Inner {
                counter: 0,
                jobs: HashMap::new(),
                windows: HashMap::new(),
            }),
        }
    }

    /// Turn a template into a job with the next id.
    ///
    /// The oldest job for the same payout address is evicted once the window
    /// is full.
    pub fn publish(&self, template: BlockTemplate) -> Arc<Job> {
        let mut inner = self.inner.write();
        inner.counter += 1;

        let job = Arc::new(Job {
            id: inner.counter,
            block: template.block,
            pre_pow_hash: template.pre_pow_hash,
            timestamp: template.timestamp,
            bits: template.bits,
            payout: template.pay_address,
            created_at: SystemTime::now(),
        });

        inner.jobs.insert(job.id, job.clone());

        let window = inner.windows.entry(job.payout.clone()).or_default();
        window.push_back(job.id);
        let evicted = if window.len() > self.retention {
            window.pop_front()
        } else {
            None
        };
        if let Some(old) = evicted {
            inner.jobs.remove(&old);
        }

        job
    }

    /// Look up a job by id.
    pub fn get(&self, job_id: u64) -> Result<Arc<Job>, JobLookupError> {
        let inner = self.inner.read();
        match inner.jobs.get(&job_id) {
            Some(job) => Ok(job.clone()),
            None if job_id == 0 || job_id > inner.counter => Err(JobLookupError::NotFound(job_id)),
            None => Err(JobLookupError::Stale(job_id)),
        }
    }

    /// Most recent job paying to `payout`, if any.
    pub fn latest_for(&self, payout: &WalletAddress) -> Option<Arc<Job>> {
        let inner = self.inner.read();
        inner
            .windows
            .get(payout)
            .and_then(|w| w.back())
            .and_then(|id| inner.jobs.get(id))
            .cloned()
    }

    /// Forget the windows and jobs of payout addresses not in `payouts`.
    ///
    /// Returns the number of jobs dropped. Their ids resolve as stale
    /// afterwards.
    pub fn retain_payouts(&self, payouts: &[WalletAddress]) -> usize {
        let mut inner = self.inner.write();
        let departed: Vec<WalletAddress> = inner
            .windows
            .keys()
            .filter(|payout| !payouts.contains(payout))
            .cloned()
            .collect();

        let mut dropped = 0;
        for payout in departed {
            if let Some(window) = inner.windows.remove(&payout) {
                for id in window {
                    if inner.jobs.remove(&id).is_some() {
                        dropped += 1;
                    }
                }
            }
        }
        dropped
    }

    /// Whether `job_id` is still inside a retention window.
    pub fn is_retained(&self, job_id: u64) -> bool {
        self.inner.read().jobs.contains_key(&job_id)
    }

    /// Number of jobs issued so far.
    pub fn issued(&self) -> u64 {
        self.inner.read().counter
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
