//! Audit outbox.
//!
//! Session and share events are queued here and delivered to the durable
//! backend by a single background task, so a slow backend never stalls a
//! miner. Every event is either delivered or written to a dead-letter file;
//! an event leaves the queue only after that attempt has finished.
//!
//! Events still queued when the process dies are lost. There is no
//! write-ahead log.

mod backend;
mod deadletter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::stats::BridgeStats;
use crate::tracing::prelude::*;

pub use backend::{BackendError, DurableBackend, HttpBackend};
pub use deadletter::{
    file_name_for, now_rfc3339, read_records, DeadLetterRecord, DeadLetterWriter,
};

/// Default wake-up period of the drain task.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Kind of audit event; doubles as the backend method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Session,
    Share,
    Block,
    Disconnect,
}

/// One queued audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub seq: u64,
    pub kind: EventKind,
    /// JSON document handed to the backend
    pub payload: String,
}

struct Queue {
    next_seq: u64,
    pending: BTreeMap<u64, AuditEvent>,
}

/// Sequence-numbered queue of audit events.
pub struct Outbox {
    coin: String,
    queue: Mutex<Queue>,
    wake: Notify,
    stats: Arc<BridgeStats>,
}

impl Outbox {
    pub fn new(coin: impl Into<String>, stats: Arc<BridgeStats>) -> Self {
        Self {
            coin: coin.into(),
            queue: Mutex::new(Queue {
                next_seq: 1,
                pending: BTreeMap::new(),
            }),
            wake: Notify::new(),
            stats,
        }
    }

    /// Queue an event and wake the drain task. Returns its sequence number.
    pub fn enqueue(&self, kind: EventKind, payload: String) -> u64 {
        let seq = {
            let mut queue = self.queue.lock();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.pending.insert(seq, AuditEvent { seq, kind, payload });
            seq
        };
        self.wake.notify_one();
        trace!(seq, kind = %kind, "Audit event queued");
        seq
    }

    /// Serialize `payload` and queue it.
    ///
    /// Serialization failure is logged and the event is not queued; the
    /// payload types used by the bridge always serialize.
    pub fn enqueue_json<T: Serialize>(&self, kind: EventKind, payload: &T) -> Option<u64> {
        match serde_json::to_string(payload) {
            Ok(json) => Some(self.enqueue(kind, json)),
            Err(e) => {
                error!(kind = %kind, error = %e, "Failed to serialize audit event");
                None
            }
        }
    }

    /// Number of events not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.lock().pending.len()
    }

    fn peek(&self) -> Option<AuditEvent> {
        self.queue
            .lock()
            .pending
            .first_key_value()
            .map(|(_, event)| event.clone())
    }

    fn remove(&self, seq: u64) {
        self.queue.lock().pending.remove(&seq);
    }

    /// Deliver one event, dead-lettering it on failure.
    async fn deliver(
        &self,
        event: &AuditEvent,
        backend: &dyn DurableBackend,
        dead_letters: &DeadLetterWriter,
    ) {
        let failure = match backend
            .execute(&self.coin, event.kind.as_ref(), &event.payload)
            .await
        {
            Ok(output) if output.is_empty() => None,
            Ok(output) => Some(output),
            Err(e) => Some(e.to_string()),
        };

        let Some(error) = failure else {
            trace!(seq = event.seq, "Audit event delivered");
            self.stats.record_delivery(false);
            return;
        };

        warn!(seq = event.seq, kind = %event.kind, error = %error, "Audit delivery failed");
        let record = DeadLetterRecord::now(
            self.coin.clone(),
            event.kind.to_string(),
            event.seq,
            event.payload.clone(),
            error,
        );
        if let Err(e) = dead_letters.append(&record).await {
            error!(
                seq = event.seq,
                dir = %dead_letters.dir().display(),
                error = %e,
                "Failed to write dead letter"
            );
        }
        self.stats.record_delivery(true);
    }

    /// Deliver everything queued, lowest sequence first.
    async fn drain_pending(
        &self,
        backend: &dyn DurableBackend,
        dead_letters: &DeadLetterWriter,
        shutdown: &CancellationToken,
    ) {
        while let Some(event) = self.peek() {
            self.deliver(&event, backend, dead_letters).await;
            self.remove(event.seq);
            if shutdown.is_cancelled() {
                break;
            }
        }
    }

    /// Run the drain loop until `shutdown` is cancelled.
    ///
    /// Wakes every `interval` or when an event is queued. A delivery already
    /// in flight when shutdown arrives is completed first.
    pub async fn run_drain(
        self: Arc<Self>,
        backend: Arc<dyn DurableBackend>,
        dead_letters: DeadLetterWriter,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!(coin = %self.coin, "Outbox drain starting");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown.cancelled() => break,
            }

            self.drain_pending(backend.as_ref(), &dead_letters, &shutdown)
                .await;

            if shutdown.is_cancelled() {
                break;
            }
        }

        let left = self.pending();
        if left > 0 {
            warn!(pending = left, "Outbox drain stopped with undelivered events");
        } else {
            info!("Outbox drain stopped");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;
    use serde_json::json;

    fn outbox() -> Arc<Outbox> {
        Arc::new(Outbox::new("kaspa", Arc::new(BridgeStats::new())))
    }

    #[test]
    fn test_sequence_numbers_are_gapless() {
        let outbox = outbox();
        let seqs: Vec<u64> = (0..5)
            .map(|i| outbox.enqueue(EventKind::Share, format!("{{\"n\":{}}}", i)))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(outbox.pending(), 5);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::Session.as_ref(), "session");
        assert_eq!(EventKind::Disconnect.to_string(), "disconnect");
        assert_eq!("block".parse::<EventKind>().unwrap(), EventKind::Block);
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let outbox = outbox();
        let backend = MockBackend::ok();
        let dir = tempfile::tempdir().unwrap();
        let writer = DeadLetterWriter::new(dir.path());

        outbox.enqueue_json(EventKind::Session, &json!({"a": 1}));
        outbox.enqueue_json(EventKind::Share, &json!({"a": 2}));
        outbox.enqueue_json(EventKind::Disconnect, &json!({"a": 3}));

        outbox
            .drain_pending(&backend, &writer, &CancellationToken::new())
            .await;

        assert_eq!(backend.methods(), vec!["session", "share", "disconnect"]);
        assert_eq!(backend.calls.lock()[0].0, "kaspa");
        assert_eq!(backend.calls.lock()[1].2, r#"{"a":2}"#);
        assert_eq!(outbox.pending(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_every_failure_is_dead_lettered_in_order() {
        let outbox = outbox();
        // Alternate transport errors and non-empty procedure output.
        let backend = MockBackend::with(|n| {
            if n % 2 == 0 {
                Ok(format!("ORA-{:05}", n))
            } else {
                Err("connection refused".to_string())
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let writer = DeadLetterWriter::new(dir.path());

        for i in 0..6 {
            outbox.enqueue_json(EventKind::Share, &json!({ "i": i }));
        }
        outbox
            .drain_pending(&backend, &writer, &CancellationToken::new())
            .await;

        assert_eq!(outbox.pending(), 0);

        let mut records = Vec::new();
        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        for f in files {
            records.extend(read_records(&f).await.unwrap());
        }

        assert_eq!(records.len(), 6);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(records[1].error, "ORA-00002");
        assert!(records[0].error.contains("connection refused"));
        assert_eq!(records[3].payload, r#"{"i":3}"#);
        assert!(records.iter().all(|r| r.coin == "kaspa" && r.method == "share"));
    }

    #[tokio::test]
    async fn test_dead_letter_write_failure_does_not_stop_drain() {
        let outbox = outbox();
        let backend = MockBackend::with(|_| Err("down".to_string()));
        let writer = DeadLetterWriter::new("/nonexistent/dir/for/dead/letters");

        outbox.enqueue(EventKind::Share, "{}".into());
        outbox.enqueue(EventKind::Share, "{}".into());
        outbox
            .drain_pending(&backend, &writer, &CancellationToken::new())
            .await;

        assert_eq!(backend.calls.lock().len(), 2);
        assert_eq!(outbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_run_drain_wakes_on_enqueue_and_stops() {
        let outbox = outbox();
        let backend = Arc::new(MockBackend::ok());
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(outbox.clone().run_drain(
            backend.clone(),
            DeadLetterWriter::new(dir.path()),
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        outbox.enqueue(EventKind::Session, "{}".into());
        for _ in 0..100 {
            if outbox.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outbox.pending(), 0);
        assert_eq!(backend.methods(), vec!["session"]);

        shutdown.cancel();
        task.await.unwrap();
    }
}
