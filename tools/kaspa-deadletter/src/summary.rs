//! Per-method and per-error counts.

use std::collections::BTreeMap;
use std::fmt;

use kaspa_bridge::outbox::DeadLetterRecord;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub by_method: BTreeMap<String, usize>,
    pub by_error: BTreeMap<String, usize>,
    /// Earliest and latest record time
    pub span: Option<(String, String)>,
}

impl Summary {
    pub fn of(records: &[DeadLetterRecord]) -> Self {
        let mut summary = Summary {
            total: records.len(),
            ..Default::default()
        };

        for record in records {
            *summary.by_method.entry(record.method.clone()).or_default() += 1;
            *summary.by_error.entry(record.error.clone()).or_default() += 1;

            // RFC 3339 UTC strings sort chronologically.
            summary.span = Some(match summary.span.take() {
                None => (record.time.clone(), record.time.clone()),
                Some((first, last)) => (
                    first.min(record.time.clone()),
                    last.max(record.time.clone()),
                ),
            });
        }

        summary
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} records", self.total)?;
        if let Some((first, last)) = &self.span {
            writeln!(f, "from {} to {}", first, last)?;
        }

        writeln!(f, "\nby method:")?;
        for (method, count) in &self.by_method {
            writeln!(f, "  {:>8}  {}", count, method)?;
        }

        writeln!(f, "\nby error:")?;
        for (error, count) in &self.by_error {
            writeln!(f, "  {:>8}  {}", count, error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(method: &str, error: &str, time: &str) -> DeadLetterRecord {
        DeadLetterRecord {
            coin: "kaspa".into(),
            method: method.into(),
            seq: 1,
            payload: "{}".into(),
            error: error.into(),
            time: time.into(),
        }
    }

    #[test]
    fn test_counts() {
        let records = [
            record("share", "timeout", "2024-05-01T10:00:02Z"),
            record("share", "timeout", "2024-05-01T10:00:01Z"),
            record("session", "HTTP 500", "2024-05-01T10:59:00Z"),
        ];
        let summary = Summary::of(&records);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_method["share"], 2);
        assert_eq!(summary.by_method["session"], 1);
        assert_eq!(summary.by_error["timeout"], 2);
        assert_eq!(
            summary.span,
            Some(("2024-05-01T10:00:01Z".into(), "2024-05-01T10:59:00Z".into()))
        );

        let text = summary.to_string();
        assert!(text.starts_with("3 records\n"));
        assert!(text.lines().any(|l| l.trim() == "2  share"));
    }

    #[test]
    fn test_empty() {
        let summary = Summary::of(&[]);
        assert_eq!(summary, Summary::default());
        assert_eq!(summary.to_string(), "0 records\n\nby method:\n\nby error:\n");
    }
}
