//! Bridge-wide counters.
//!
//! Components bump these as they go; the stats API and logs read a
//! [`StatsSnapshot`]. All counters are relaxed atomics, so a snapshot is
//! approximate while traffic is flowing.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters.
#[derive(Debug, Default)]
pub struct BridgeStats {
    sessions_live: AtomicU64,
    sessions_authorized: AtomicU64,
    shares_accepted: AtomicU64,
    shares_stale: AtomicU64,
    shares_duplicate: AtomicU64,
    shares_low_difficulty: AtomicU64,
    shares_invalid: AtomicU64,
    blocks_submitted: AtomicU64,
    blocks_accepted: AtomicU64,
    events_delivered: AtomicU64,
    events_dead_lettered: AtomicU64,
}

/// Which counter a share outcome lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareCounter {
    Accepted,
    Stale,
    Duplicate,
    LowDifficulty,
    Invalid,
}

/// Point-in-time copy of the counters, plus gauges owned elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sessions_live: u64,
    pub sessions_authorized: u64,
    pub jobs_issued: u64,
    pub shares_accepted: u64,
    pub shares_stale: u64,
    pub shares_duplicate: u64,
    pub shares_low_difficulty: u64,
    pub shares_invalid: u64,
    pub blocks_submitted: u64,
    pub blocks_accepted: u64,
    pub outbox_pending: u64,
    pub events_delivered: u64,
    pub events_dead_lettered: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        // Never wraps below zero even if a close is double counted.
        let _ = self
            .sessions_live
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn session_authorized(&self) {
        self.sessions_authorized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_share(&self, counter: ShareCounter) {
        let c = match counter {
            ShareCounter::Accepted => &self.shares_accepted,
            ShareCounter::Stale => &self.shares_stale,
            ShareCounter::Duplicate => &self.shares_duplicate,
            ShareCounter::LowDifficulty => &self.shares_low_difficulty,
            ShareCounter::Invalid => &self.shares_invalid,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_block(&self, accepted: bool) {
        self.blocks_submitted.fetch_add(1, Ordering::Relaxed);
        if accepted {
            self.blocks_accepted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_delivery(&self, dead_lettered: bool) {
        if dead_lettered {
            self.events_dead_lettered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy the counters. Gauges held by other components are filled in by
    /// the caller.
    pub fn snapshot(&self, jobs_issued: u64, outbox_pending: u64) -> StatsSnapshot {
        StatsSnapshot {
            sessions_live: self.sessions_live.load(Ordering::Relaxed),
            sessions_authorized: self.sessions_authorized.load(Ordering::Relaxed),
            jobs_issued,
            shares_accepted: self.shares_accepted.load(Ordering::Relaxed),
            shares_stale: self.shares_stale.load(Ordering::Relaxed),
            shares_duplicate: self.shares_duplicate.load(Ordering::Relaxed),
            shares_low_difficulty: self.shares_low_difficulty.load(Ordering::Relaxed),
            shares_invalid: self.shares_invalid.load(Ordering::Relaxed),
            blocks_submitted: self.blocks_submitted.load(Ordering::Relaxed),
            blocks_accepted: self.blocks_accepted.load(Ordering::Relaxed),
            outbox_pending,
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
        }
    }
}
