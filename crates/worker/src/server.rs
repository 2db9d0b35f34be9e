//! Local-loopback job service.
//!
//! Serves the same job API the requester consumes (`POST /run`,
//! `GET /status/{id}`, `POST /cancel/{id}`, `GET /health`) over an
//! in-memory job table. Accepted jobs are queued on an mpsc channel and
//! run one at a time, in submission order, by a single executor task.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use comfyrun_core::error::CoreError;
use comfyrun_core::output::HandlerOutput;
use comfyrun_core::types::{JobId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::{AppError, AppResult};
use crate::handler::JobHandler;

/// Lifecycle of a job inside the service, in the remote API's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InQueue => "IN_QUEUE",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One job as reported by `GET /status/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct RunEntry {
    pub id: JobId,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<HandlerOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

/// Response body of `POST /run`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub id: JobId,
    pub status: RunStatus,
}

/// Job counts reported by `GET /health`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub in_queue: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug)]
struct QueuedJob {
    id: JobId,
    input: Option<Value>,
}

/// Shared state of the job service.
#[derive(Clone)]
pub struct AppState {
    jobs: Arc<RwLock<HashMap<JobId, RunEntry>>>,
    queue: mpsc::UnboundedSender<QueuedJob>,
}

impl AppState {
    /// Current view of a job, if known.
    pub async fn job(&self, id: &str) -> Option<RunEntry> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn counts(&self) -> JobCounts {
        let jobs = self.jobs.read().await;
        let mut counts = JobCounts::default();
        for entry in jobs.values() {
            match entry.status {
                RunStatus::InQueue => counts.in_queue += 1,
                RunStatus::InProgress => counts.in_progress += 1,
                RunStatus::Completed => counts.completed += 1,
                RunStatus::Failed => counts.failed += 1,
                RunStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// Start the executor task and return the state the router serves.
///
/// The executor stops when `cancel` fires. A job that is already running
/// is allowed to finish first.
pub fn start(handler: Arc<JobHandler>, cancel: CancellationToken) -> (AppState, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = AppState {
        jobs: Arc::new(RwLock::new(HashMap::new())),
        queue: tx,
    };
    let handle = tokio::spawn(run_executor(state.jobs.clone(), rx, handler, cancel));
    (state, handle)
}

async fn run_executor(
    jobs: Arc<RwLock<HashMap<JobId, RunEntry>>>,
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    handler: Arc<JobHandler>,
    cancel: CancellationToken,
) {
    tracing::info!("Job executor started");

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job executor stopping (cancelled)");
                break;
            }
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        {
            let mut jobs = jobs.write().await;
            match jobs.get_mut(&job.id) {
                Some(entry) if entry.status == RunStatus::InQueue => {
                    entry.status = RunStatus::InProgress;
                    entry.started_at = Some(Utc::now());
                }
                _ => {
                    tracing::debug!(job_id = %job.id, "Skipping job that is no longer queued");
                    continue;
                }
            }
        }

        let result = handler.handle(&job.id, job.input.as_ref()).await;

        let mut jobs = jobs.write().await;
        if let Some(entry) = jobs.get_mut(&job.id) {
            entry.finished_at = Some(Utc::now());
            match result {
                Ok(output) => {
                    tracing::info!(
                        job_id = %job.id,
                        success = output.is_success(),
                        "Job completed",
                    );
                    entry.status = RunStatus::Completed;
                    entry.output = Some(output);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Job failed");
                    entry.status = RunStatus::Failed;
                    entry.error = Some(e.to_string());
                }
            }
        }
    }
}

/// Build the job service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_job))
        .route("/status/{id}", get(job_status))
        .route("/cancel/{id}", post(cancel_job))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn run_job(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> AppResult<Json<RunAccepted>> {
    let mut body = match body {
        Value::Object(map) => map,
        _ => return Err(AppError::BadRequest("request body must be a JSON object".into())),
    };

    let id = uuid::Uuid::new_v4().to_string();
    let entry = RunEntry {
        id: id.clone(),
        status: RunStatus::InQueue,
        output: None,
        error: None,
        created_at: Utc::now(),
        started_at: None,
        finished_at: None,
    };
    state.jobs.write().await.insert(id.clone(), entry);

    let queued = QueuedJob {
        id: id.clone(),
        input: body.remove("input"),
    };
    if state.queue.send(queued).is_err() {
        state.jobs.write().await.remove(&id);
        return Err(CoreError::Internal("job executor is not running".into()).into());
    }

    tracing::info!(job_id = %id, "Job queued");
    Ok(Json(RunAccepted {
        id,
        status: RunStatus::InQueue,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RunEntry>> {
    state
        .job(&id)
        .await
        .map(Json)
        .ok_or_else(|| CoreError::NotFound { entity: "Job", id }.into())
}

/// Only queued jobs can be cancelled.
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<RunEntry>> {
    let mut jobs = state.jobs.write().await;
    let Some(entry) = jobs.get_mut(&id) else {
        return Err(CoreError::NotFound { entity: "Job", id }.into());
    };

    match entry.status {
        RunStatus::InQueue => {
            entry.status = RunStatus::Cancelled;
            entry.finished_at = Some(Utc::now());
            tracing::info!(job_id = %id, "Job cancelled");
            Ok(Json(entry.clone()))
        }
        status => Err(CoreError::Conflict(format!(
            "job {id} is {status} and cannot be cancelled"
        ))
        .into()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub jobs: JobCounts,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        jobs: state.counts().await,
    })
}
