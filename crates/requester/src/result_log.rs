//! Append-only CSV log with one row per terminal job.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use comfyrun_core::job::{JobRecord, JobStatus};
use comfyrun_core::types::{JobId, Timestamp};
use tokio::io::AsyncWriteExt;

/// Header line written once when a log is created.
pub const HEADER: &str = "job_id,start_time,end_time,response_time_sec,status,image_path";

#[derive(Debug, thiserror::Error)]
#[error("failed to write result log {}: {source}", path.display())]
pub struct ResultLogError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// One logged job.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultLogEntry {
    pub job_id: JobId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub response_time_sec: f64,
    pub status: JobStatus,
    /// Result reference for completed jobs, failure detail otherwise.
    pub image_path: String,
}

impl ResultLogEntry {
    /// Build the row for a terminal record; `None` while it is pending.
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        if !record.is_terminal() {
            return None;
        }
        let end_time = record.completed_at?;
        let image_path = match (&record.result_ref, &record.failure_detail) {
            (Some(result), _) => result.to_string(),
            (None, Some(detail)) => detail.clone(),
            (None, None) => String::new(),
        };
        Some(Self {
            job_id: record.id.clone(),
            start_time: record.submitted_at,
            end_time,
            response_time_sec: record.duration_seconds.unwrap_or_default(),
            status: record.status,
            image_path,
        })
    }

    /// The CSV line for this entry, without the trailing newline.
    pub fn to_csv_row(&self) -> String {
        let start = self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true);
        let end = self.end_time.to_rfc3339_opts(SecondsFormat::Millis, true);
        let seconds = format!("{:.2}", self.response_time_sec);
        [
            escape_field(&self.job_id),
            Cow::Owned(start),
            Cow::Owned(end),
            Cow::Owned(seconds),
            Cow::Borrowed(self.status.as_str()),
            escape_field(&self.image_path),
        ]
        .join(",")
    }
}

/// Quote a field containing `,`, `"`, CR or LF, doubling inner quotes.
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// Handle to a result log file.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    /// Create (or truncate) the log at `path` and write the header.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, ResultLogError> {
        let path = path.into();
        let io_err = |source| ResultLogError {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, format!("{HEADER}\n"))
            .await
            .map_err(io_err)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it to disk.
    pub async fn append(&self, entry: &ResultLogEntry) -> Result<(), ResultLogError> {
        let io_err = |source| ResultLogError {
            path: self.path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        let line = format!("{}\n", entry.to_csv_row());
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use comfyrun_core::job::ResultRef;

    use super::*;

    fn completed_record() -> JobRecord {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut record = JobRecord::pending("abc123", start);
        record
            .complete(
                ResultRef::RemoteUrl("https://cdn.example/abc123/out.png".into()),
                start + Duration::milliseconds(12_346),
            )
            .unwrap();
        record
    }

    #[test]
    fn escaping_only_when_needed() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn row_format() {
        let entry = ResultLogEntry::from_record(&completed_record()).unwrap();
        assert_eq!(
            entry.to_csv_row(),
            concat!(
                "abc123,2024-05-01T12:00:00.000Z,2024-05-01T12:00:12.346Z,12.35,",
                "COMPLETED,https://cdn.example/abc123/out.png",
            )
        );
    }

    #[test]
    fn failure_detail_fills_image_path() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut record = JobRecord::pending("j", start);
        record
            .fail(JobStatus::Failed, Some("disk full, retry".into()), start)
            .unwrap();

        let entry = ResultLogEntry::from_record(&record).unwrap();
        assert_eq!(entry.image_path, "disk full, retry");
        assert!(entry.to_csv_row().ends_with(",FAILED,\"disk full, retry\""));
    }

    #[test]
    fn pending_record_has_no_row() {
        let record = JobRecord::pending("j", Utc::now());
        assert!(ResultLogEntry::from_record(&record).is_none());
    }

    #[tokio::test]
    async fn header_written_once_then_rows_appended() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResultLog::create(dir.path().join("run/results_log.csv")).await.unwrap();
        let entry = ResultLogEntry::from_record(&completed_record()).unwrap();

        log.append(&entry).await.unwrap();
        log.append(&entry).await.unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("abc123,"));
    }
}
