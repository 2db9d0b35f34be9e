//! Job lifecycle record tracked between submission and result logging.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a submitted job.
///
/// `Pending` is the only non-terminal state. Once a record reaches one of
/// the other three it never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Wire / log representation (`PENDING`, `COMPLETED`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Result reference
// ---------------------------------------------------------------------------

/// Where the materialized output of a completed job ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResultRef {
    /// Decoded output written to the local filesystem.
    LocalPath(PathBuf),
    /// Output uploaded to remote storage.
    RemoteUrl(String),
    /// Output kept as an inline base64 payload.
    Inline(String),
}

impl fmt::Display for ResultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalPath(path) => write!(f, "{}", path.display()),
            Self::RemoteUrl(url) => f.write_str(url),
            Self::Inline(data) => f.write_str(data),
        }
    }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// One submitted job, from registration until its terminal row is logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub submitted_at: Timestamp,
    pub status: JobStatus,
    /// Present only once `status` is [`JobStatus::Completed`].
    pub result_ref: Option<ResultRef>,
    /// Resolver or remote error text for failed / cancelled jobs.
    pub failure_detail: Option<String>,
    pub completed_at: Option<Timestamp>,
    pub duration_seconds: Option<f64>,
}

impl JobRecord {
    /// A freshly submitted job.
    pub fn pending(id: impl Into<JobId>, submitted_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            submitted_at,
            status: JobStatus::Pending,
            result_ref: None,
            failure_detail: None,
            completed_at: None,
            duration_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition `PENDING -> COMPLETED` with the materialized result.
    pub fn complete(&mut self, result_ref: ResultRef, at: Timestamp) -> Result<(), CoreError> {
        self.finish(JobStatus::Completed, at)?;
        self.result_ref = Some(result_ref);
        Ok(())
    }

    /// Transition `PENDING -> FAILED | CANCELLED`.
    pub fn fail(
        &mut self,
        status: JobStatus,
        detail: Option<String>,
        at: Timestamp,
    ) -> Result<(), CoreError> {
        if !matches!(status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(CoreError::Validation(format!(
                "'{status}' is not a failure status"
            )));
        }
        self.finish(status, at)?;
        self.failure_detail = detail;
        Ok(())
    }

    fn finish(&mut self, status: JobStatus, at: Timestamp) -> Result<(), CoreError> {
        if self.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "job {} is already {} and cannot become {status}",
                self.id, self.status
            )));
        }
        let elapsed = at - self.submitted_at;
        self.status = status;
        self.completed_at = Some(at);
        self.duration_seconds = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
        Ok(())
    }
}
