use std::sync::Arc;

use chrono::Utc;
use comfyrun_core::job::JobRecord;
use comfyrun_core::types::JobId;
use serde_json::Value;

use crate::api::{JobApi, RemoteApiError};
use crate::poller::{TrackerClosed, TrackerHandle};

/// Errors from a single submission. None of them are retried.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Api(#[from] RemoteApiError),

    /// The service accepted the request but returned no job id.
    #[error("job API response did not contain a job id")]
    MissingJobId,

    #[error(transparent)]
    TrackerClosed(#[from] TrackerClosed),
}

/// Posts jobs and registers them with the result poller.
#[derive(Clone)]
pub struct JobSubmitter {
    api: Arc<dyn JobApi>,
    tracker: TrackerHandle,
}

impl JobSubmitter {
    pub fn new(api: Arc<dyn JobApi>, tracker: TrackerHandle) -> Self {
        Self { api, tracker }
    }

    pub fn tracker(&self) -> &TrackerHandle {
        &self.tracker
    }

    /// Send one job request and start tracking the returned id.
    pub async fn submit(&self, payload: &Value) -> Result<JobId, SubmitError> {
        let submitted_at = Utc::now();
        let response = self.api.run(payload).await?;

        let job_id = response
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or(SubmitError::MissingJobId)?;

        self.tracker
            .register(JobRecord::pending(job_id.clone(), submitted_at))?;
        tracing::info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }
}
