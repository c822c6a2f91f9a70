//! Re-delivery of dead-lettered records.

use std::path::PathBuf;

use kaspa_bridge::outbox::{DeadLetterRecord, DeadLetterWriter, DurableBackend};
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub struct Report {
    pub delivered: usize,
    pub failed: usize,
    /// Files the failures were appended to
    pub written: Vec<PathBuf>,
}

/// Send each record through `backend` in order. Records that fail again are
/// written to `writer` with the new error and time, keeping their sequence
/// number.
pub async fn replay(
    records: &[DeadLetterRecord],
    backend: &dyn DurableBackend,
    writer: &DeadLetterWriter,
) -> Report {
    let mut report = Report::default();

    for record in records {
        let failure = match backend
            .execute(&record.coin, &record.method, &record.payload)
            .await
        {
            Ok(output) if output.is_empty() => None,
            Ok(output) => Some(output),
            Err(e) => Some(e.to_string()),
        };

        let Some(reason) = failure else {
            debug!(seq = record.seq, method = %record.method, "Record delivered");
            report.delivered += 1;
            continue;
        };

        warn!(seq = record.seq, method = %record.method, error = %reason, "Record failed again");
        report.failed += 1;
        let again = DeadLetterRecord::now(
            record.coin.clone(),
            record.method.clone(),
            record.seq,
            record.payload.clone(),
            reason,
        );
        match writer.append(&again).await {
            Ok(path) => {
                if !report.written.contains(&path) {
                    report.written.push(path);
                }
            }
            Err(e) => error!(seq = record.seq, error = %e, "Failed to write dead letter"),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kaspa_bridge::outbox::{read_records, BackendError};
    use std::sync::Mutex;

    /// Refuses every `share` record.
    struct RejectShares {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DurableBackend for RejectShares {
        async fn execute(&self, _coin: &str, method: &str, input: &str) -> Result<String, BackendError> {
            self.seen.lock().unwrap().push(input.len() as u64);
            if method == "share" {
                Ok("duplicate key".into())
            } else {
                Ok(String::new())
            }
        }
    }

    fn record(seq: u64, method: &str) -> DeadLetterRecord {
        DeadLetterRecord {
            coin: "kaspa".into(),
            method: method.into(),
            seq,
            payload: format!("{{\"n\":{seq}}}"),
            error: "timeout".into(),
            time: "2024-05-01T10:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn test_failures_written_again() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DeadLetterWriter::new(dir.path());
        let backend = RejectShares {
            seen: Mutex::new(Vec::new()),
        };

        let records = [record(1, "session"), record(2, "share"), record(3, "disconnect")];
        let report = replay(&records, &backend, &writer).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(backend.seen.lock().unwrap().len(), 3);
        assert_eq!(report.written.len(), 1);

        let again = read_records(&report.written[0]).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].seq, 2);
        assert_eq!(again[0].error, "duplicate key");
        assert_eq!(again[0].payload, records[1].payload);
    }
}
