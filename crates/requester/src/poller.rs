//! Background result poller.
//!
//! A single long-lived Tokio task owns the [`JobState`]. Submitters talk to
//! it through a [`TrackerHandle`]: registrations and snapshot requests
//! travel over one unbounded mpsc channel, so a snapshot requested after a
//! registration always sees it. Every `interval` the poller checks the
//! remote status of each pending job, materializes completed outputs,
//! appends a row per terminal job to the [`ResultLog`], and drops the
//! record once the row is written.
//!
//! The task ends when every handle has been dropped and no record is left;
//! its `JoinHandle` then resolves with a [`PollSummary`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use comfyrun_core::job::{JobRecord, JobStatus, ResultRef};
use comfyrun_core::types::JobId;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::{JobApi, RemoteStatus};
use crate::outputs::OutputMaterializer;
use crate::result_log::{ResultLog, ResultLogEntry};
use crate::state::JobState;

/// Default time between poll cycles.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest accepted time between poll cycles.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on status requests in flight during one cycle.
pub const STATUS_CONCURRENCY: usize = 8;

/// Messages accepted by the poller task.
#[derive(Debug)]
pub enum TrackerCommand {
    /// Start tracking a freshly submitted job.
    Register(JobRecord),
    /// Reply with a copy of every tracked record.
    Snapshot(oneshot::Sender<Vec<JobRecord>>),
}

/// The poller task is gone.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("result poller has stopped")]
pub struct TrackerClosed;

/// Cloneable sender side of the poller.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerCommand>,
    tracked: watch::Receiver<usize>,
}

impl TrackerHandle {
    pub fn register(&self, record: JobRecord) -> Result<(), TrackerClosed> {
        self.tx
            .send(TrackerCommand::Register(record))
            .map_err(|_| TrackerClosed)
    }

    /// Every record currently held by the poller, oldest first.
    pub async fn snapshot(&self) -> Result<Vec<JobRecord>, TrackerClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TrackerCommand::Snapshot(reply))
            .map_err(|_| TrackerClosed)?;
        rx.await.map_err(|_| TrackerClosed)
    }

    /// Number of records in the poller's state as of its last iteration.
    pub fn tracked_count(&self) -> usize {
        *self.tracked.borrow()
    }

    /// Receiver that changes whenever the tracked count changes.
    pub fn watch_tracked(&self) -> watch::Receiver<usize> {
        self.tracked.clone()
    }
}

/// Totals reported when the poller exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Status requests that failed and were retried on a later cycle.
    pub status_errors: usize,
    /// Row writes that failed and were retried on a later cycle.
    pub log_errors: usize,
    pub cycles: u64,
}

impl PollSummary {
    /// Jobs that reached a terminal status and were logged.
    pub fn logged(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Pending => {}
        }
    }
}

/// Result of checking one pending job.
enum Check {
    Pending,
    Completed(ResultRef),
    Ended {
        status: JobStatus,
        detail: Option<String>,
    },
    Unreachable,
}

/// Polls remote status for tracked jobs and logs their results.
pub struct ResultPoller {
    api: Arc<dyn JobApi>,
    outputs: OutputMaterializer,
    log: ResultLog,
    interval: Duration,
    state: JobState,
}

impl ResultPoller {
    pub fn new(api: Arc<dyn JobApi>, outputs: OutputMaterializer, log: ResultLog) -> Self {
        Self {
            api,
            outputs,
            log,
            interval: DEFAULT_CHECK_INTERVAL,
            state: JobState::new(),
        }
    }

    /// Time between poll cycles. A zero interval is raised to
    /// [`MIN_CHECK_INTERVAL`].
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Spawn the poller task.
    pub fn spawn(self) -> (TrackerHandle, JoinHandle<PollSummary>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (tracked_tx, tracked_rx) = watch::channel(0);
        let handle = TrackerHandle {
            tx,
            tracked: tracked_rx,
        };
        (handle, tokio::spawn(self.run(rx, tracked_tx)))
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<TrackerCommand>,
        tracked: watch::Sender<usize>,
    ) -> PollSummary {
        let mut summary = PollSummary::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = true;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Result poller started",
        );

        loop {
            tokio::select! {
                cmd = rx.recv(), if open => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => {
                        tracing::debug!(
                            remaining = self.state.len(),
                            "All tracker handles dropped",
                        );
                        open = false;
                    }
                },
                _ = ticker.tick() => {
                    self.poll_cycle(&mut summary).await;
                }
            }

            tracked.send_replace(self.state.len());

            if !open && self.state.is_empty() {
                break;
            }
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            cycles = summary.cycles,
            "Result poller finished",
        );
        summary
    }

    fn apply(&mut self, cmd: TrackerCommand) {
        match cmd {
            TrackerCommand::Register(record) => {
                let job_id = record.id.clone();
                if self.state.insert(record) {
                    tracing::debug!(job_id = %job_id, "Tracking job");
                } else {
                    tracing::warn!(job_id = %job_id, "Job is already tracked, ignoring duplicate");
                }
            }
            TrackerCommand::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    /// One cycle: check pending jobs, apply transitions, log terminal jobs.
    async fn poll_cycle(&mut self, summary: &mut PollSummary) {
        summary.cycles += 1;

        let pending = self.state.pending_ids();
        if !pending.is_empty() {
            let api = self.api.as_ref();
            let outputs = &self.outputs;
            let checks: Vec<(JobId, Check)> = stream::iter(pending)
                .map(|id| async move {
                    let check = check_job(api, outputs, &id).await;
                    (id, check)
                })
                .buffer_unordered(STATUS_CONCURRENCY)
                .collect()
                .await;

            for (id, check) in checks {
                if matches!(check, Check::Unreachable) {
                    summary.status_errors += 1;
                }
                self.transition(&id, check);
            }
        }

        self.flush_terminal(summary).await;
    }

    fn transition(&mut self, id: &str, check: Check) {
        let Some(record) = self.state.get_mut(id) else {
            return;
        };
        let now = Utc::now();
        let result = match check {
            Check::Pending | Check::Unreachable => return,
            Check::Completed(result_ref) => record.complete(result_ref, now),
            Check::Ended { status, detail } => record.fail(status, detail, now),
        };
        match result {
            Ok(()) => tracing::info!(
                job_id = %id,
                status = %record.status,
                duration_seconds = record.duration_seconds.unwrap_or_default(),
                "Job finished",
            ),
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Ignoring transition"),
        }
    }

    /// Log every terminal record and drop the ones whose row was written.
    async fn flush_terminal(&mut self, summary: &mut PollSummary) {
        for id in self.state.terminal_ids() {
            let Some(entry) = self.state.get(&id).and_then(ResultLogEntry::from_record) else {
                continue;
            };
            match self.log.append(&entry).await {
                Ok(()) => {
                    self.state.remove(&id);
                    summary.record(entry.status);
                }
                Err(e) => {
                    summary.log_errors += 1;
                    tracing::error!(job_id = %id, error = %e, "Failed to log result, will retry");
                }
            }
        }
    }
}

async fn check_job(api: &dyn JobApi, outputs: &OutputMaterializer, id: &str) -> Check {
    let response = match api.status(id).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(job_id = %id, error = %e, "Status check failed, will retry");
            return Check::Unreachable;
        }
    };

    match response.status.job_status() {
        JobStatus::Pending => {
            if response.status == RemoteStatus::Unknown {
                tracing::warn!(job_id = %id, "Unrecognized remote status, treating as pending");
            }
            Check::Pending
        }
        JobStatus::Completed => match outputs.materialize(id, response.output.as_ref()).await {
            Ok(result_ref) => Check::Completed(result_ref),
            Err(e) => {
                tracing::warn!(
                    job_id = %id,
                    error = %e,
                    "Completed job output could not be resolved",
                );
                Check::Ended {
                    status: JobStatus::Failed,
                    detail: Some(e.to_string()),
                }
            }
        },
        status => Check::Ended {
            status,
            detail: response.error_message(),
        },
    }
}
