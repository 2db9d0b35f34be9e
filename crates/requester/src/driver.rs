//! Submission driver: issue N jobs at a fixed interval, then wait for the
//! result poller to drain.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone};
use comfyrun_core::types::JobId;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::poller::PollSummary;
use crate::submitter::JobSubmitter;

/// File name of the per-run result log.
pub const RESULT_LOG_FILE: &str = "results_log.csv";

/// Directory layout of one run: `<log_root>/<YYYYmmdd_HHMMSS>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub root: PathBuf,
    pub log_path: PathBuf,
    pub output_dir: PathBuf,
}

impl RunLayout {
    pub fn new<Tz: TimeZone>(log_root: &Path, started_at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let root = log_root.join(started_at.format("%Y%m%d_%H%M%S").to_string());
        Self {
            log_path: root.join(RESULT_LOG_FILE),
            output_dir: root.join("output"),
            root,
        }
    }

    /// Create the run and output directories.
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await
    }
}

/// Outcome of a driven run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Ids of accepted jobs, in submission order.
    pub submitted: Vec<JobId>,
    /// Submissions that returned an error.
    pub rejected: usize,
    pub summary: PollSummary,
}

/// The poller task panicked or was aborted.
#[derive(Debug, thiserror::Error)]
#[error("result poller did not finish: {0}")]
pub struct PollerJoinError(#[from] tokio::task::JoinError);

/// Submit `payload` `count` times, sleeping `interval` between submissions,
/// then wait until every accepted job has been logged.
///
/// Takes the last submitter so the poller can observe the channel closing.
/// Per-job submission errors are logged and counted; they never stop the
/// batch.
pub async fn drive(
    submitter: JobSubmitter,
    poller: JoinHandle<PollSummary>,
    payload: &Value,
    count: usize,
    interval: Duration,
) -> Result<RunReport, PollerJoinError> {
    let mut report = RunReport::default();

    for n in 0..count {
        if n > 0 && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
        match submitter.submit(payload).await {
            Ok(job_id) => report.submitted.push(job_id),
            Err(e) => {
                report.rejected += 1;
                tracing::error!(attempt = n + 1, error = %e, "Submission failed");
            }
        }
    }

    tracing::info!(
        submitted = report.submitted.len(),
        rejected = report.rejected,
        tracked = submitter.tracker().tracked_count(),
        "All submissions sent, waiting for results",
    );
    drop(submitter);

    report.summary = poller.await?;
    Ok(report)
}
