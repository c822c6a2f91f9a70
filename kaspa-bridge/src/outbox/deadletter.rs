//! Dead-letter files for audit records the backend did not take.
//!
//! Records are appended as JSON lines to a file named for the current UTC
//! hour, `errdata_YYYY-MM-DDTHH.txt`, so an operator can replay one hour at a
//! time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;

/// One undelivered audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub coin: String,
    pub method: String,
    pub seq: u64,
    /// The JSON input the backend was given
    pub payload: String,
    pub error: String,
    /// RFC 3339, UTC
    pub time: String,
}

impl DeadLetterRecord {
    /// A record stamped with the current time.
    pub fn now(
        coin: impl Into<String>,
        method: impl Into<String>,
        seq: u64,
        payload: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            coin: coin.into(),
            method: method.into(),
            seq,
            payload: payload.into(),
            error: error.into(),
            time: now_rfc3339(),
        }
    }
}

/// Current UTC time as RFC 3339, the timestamp format of audit records.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// File name for records written during the hour containing `at`.
pub fn file_name_for(at: OffsetDateTime) -> String {
    let at = at.to_offset(time::UtcOffset::UTC);
    format!(
        "errdata_{:04}-{:02}-{:02}T{:02}.txt",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour()
    )
}

/// Appends records to hour-keyed files in one directory.
#[derive(Debug, Clone)]
pub struct DeadLetterWriter {
    dir: PathBuf,
}

impl DeadLetterWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one record, returning the file written to.
    pub async fn append(&self, record: &DeadLetterRecord) -> std::io::Result<PathBuf> {
        let path = self.dir.join(file_name_for(OffsetDateTime::now_utc()));

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(path)
    }
}

/// Read every record in a dead-letter file.
///
/// Blank lines are skipped; a malformed line is an error naming its line
/// number.
pub async fn read_records(path: &Path) -> std::io::Result<Vec<DeadLetterRecord>> {
    let text = tokio::fs::read_to_string(path).await?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{}:{}: {}", path.display(), n + 1, e),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_file_name_is_utc_hour() {
        assert_eq!(
            file_name_for(datetime!(2024-03-07 09:59:59 UTC)),
            "errdata_2024-03-07T09.txt"
        );
        // 01:30 at +02:00 is 23:30 UTC the day before.
        assert_eq!(
            file_name_for(datetime!(2024-03-07 01:30:00 +2)),
            "errdata_2024-03-06T23.txt"
        );
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DeadLetterWriter::new(dir.path());

        let first = DeadLetterRecord::now("kaspa", "share", 1, "{\"a\":1}", "timeout");
        let second = DeadLetterRecord::now("kaspa", "block", 2, "{}", "ORA-00001");
        let path = writer.append(&first).await.unwrap();
        let path2 = writer.append(&second).await.unwrap();
        assert_eq!(path.parent(), Some(dir.path()));

        // Both writes may straddle an hour boundary; read whatever was written.
        let mut records = read_records(&path).await.unwrap();
        if path2 != path {
            records.extend(read_records(&path2).await.unwrap());
        }
        assert_eq!(records, vec![first, second]);
    }

    #[tokio::test]
    async fn test_read_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errdata_2024-01-01T00.txt");
        tokio::fs::write(&path, "\nnot json\n").await.unwrap();
        let err = read_records(&path).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert!(err.to_string().contains(":2:"));
    }
}
