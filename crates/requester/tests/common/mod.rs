#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use comfyrun_comfyui::resolver::ArtifactResolver;
use comfyrun_requester::api::{JobApi, RemoteApiError, RemoteStatus, RunResponse, StatusResponse};
use comfyrun_requester::outputs::OutputMaterializer;
use comfyrun_requester::poller::{PollSummary, ResultPoller, TrackerHandle};
use comfyrun_requester::result_log::ResultLog;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Scripted in-memory job API.
///
/// Ids come from `ids` in order, then `job-<n>`. A new job reports
/// `initial` until [`set_status`](Self::set_status) replaces it.
#[derive(Default)]
pub struct FakeJobApi {
    pub payloads: Mutex<Vec<Value>>,
    ids: Mutex<Vec<Option<String>>>,
    next: AtomicU32,
    initial: Mutex<Option<StatusResponse>>,
    statuses: Mutex<HashMap<String, StatusResponse>>,
    /// Status calls that fail with a 503 before the script applies.
    failures_left: AtomicU32,
    pub status_calls: AtomicU32,
}

impl FakeJobApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out these `run` responses first; `None` omits the id.
    pub fn with_ids(self, ids: Vec<Option<&str>>) -> Self {
        *self.ids.lock().unwrap() = ids.into_iter().rev().map(|id| id.map(String::from)).collect();
        self
    }

    /// Status every new job starts with (default `IN_QUEUE`).
    pub fn with_initial(self, status: RemoteStatus, output: Option<Value>) -> Self {
        let mut response = StatusResponse::new("", status);
        response.output = output;
        *self.initial.lock().unwrap() = Some(response);
        self
    }

    pub fn with_status_failures(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn set_status(&self, id: &str, response: StatusResponse) {
        self.statuses.lock().unwrap().insert(id.to_string(), response);
    }

    pub fn run_calls(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl JobApi for FakeJobApi {
    async fn run(&self, payload: &Value) -> Result<RunResponse, RemoteApiError> {
        self.payloads.lock().unwrap().push(payload.clone());
        let id = match self.ids.lock().unwrap().pop() {
            Some(id) => id,
            None => Some(format!("job-{}", self.next.fetch_add(1, Ordering::SeqCst) + 1)),
        };
        if let Some(id) = &id {
            let mut initial = self
                .initial
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| StatusResponse::new("", RemoteStatus::InQueue));
            initial.id = Some(id.clone());
            self.statuses.lock().unwrap().insert(id.clone(), initial);
        }
        Ok(RunResponse {
            id,
            status: Some(RemoteStatus::InQueue),
        })
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, RemoteApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RemoteApiError::ApiError {
                status: 503,
                body: "upstream unavailable".into(),
            });
        }
        self.statuses
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| RemoteApiError::ApiError {
                status: 404,
                body: format!("unknown job {job_id}"),
            })
    }
}

pub const FAST_POLL: Duration = Duration::from_millis(10);

/// Spawn a poller writing to `<dir>/run/results_log.csv` and saving outputs
/// under `<dir>/output`, resolving manifests against `<dir>/comfy`.
pub async fn spawn_poller(
    api: Arc<FakeJobApi>,
    dir: &Path,
) -> (TrackerHandle, JoinHandle<PollSummary>, ResultLog) {
    let log = ResultLog::create(dir.join("run").join("results_log.csv"))
        .await
        .expect("create result log");
    let outputs = OutputMaterializer::new(ArtifactResolver::new(dir.join("comfy")))
        .with_output_dir(dir.join("output"));
    let (tracker, handle) = ResultPoller::new(api, outputs, log.clone())
        .with_interval(FAST_POLL)
        .spawn();
    (tracker, handle, log)
}

/// Data rows of a result log, split on commas (test values contain none).
pub fn log_rows(log: &ResultLog) -> Vec<Vec<String>> {
    let contents = std::fs::read_to_string(log.path()).expect("read result log");
    contents
        .lines()
        .skip(1)
        .map(|line| line.split(',').map(String::from).collect())
        .collect()
}

/// Await the poller with a generous upper bound.
pub async fn finish(handle: JoinHandle<PollSummary>) -> PollSummary {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("poller should drain")
        .expect("poller task")
}
