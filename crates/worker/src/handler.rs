//! Per-job pipeline: validate, fetch inputs, run the workflow, resolve the
//! generated image.

use std::sync::Arc;

use comfyrun_comfyui::materializer::InputMaterializer;
use comfyrun_comfyui::resolver::{ArtifactError, ArtifactResolver};
use comfyrun_comfyui::workflow::{WorkflowError, WorkflowRunner};
use comfyrun_core::error::CoreError;
use comfyrun_core::input::validate_input;
use comfyrun_core::output::HandlerOutput;
use serde_json::Value;

/// A job that could not produce any output envelope.
///
/// The job service reports these as `FAILED` with the error text.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Artifact(ArtifactError),
}

/// Runs one job end to end.
pub struct JobHandler {
    materializer: InputMaterializer,
    runner: Arc<dyn WorkflowRunner>,
    resolver: ArtifactResolver,
    refresh_worker: bool,
}

impl JobHandler {
    pub fn new(
        materializer: InputMaterializer,
        runner: Arc<dyn WorkflowRunner>,
        resolver: ArtifactResolver,
    ) -> Self {
        Self {
            materializer,
            runner,
            resolver,
            refresh_worker: false,
        }
    }

    pub fn with_refresh_worker(mut self, refresh_worker: bool) -> Self {
        self.refresh_worker = refresh_worker;
        self
    }

    /// Handle the raw `input` object of a job.
    ///
    /// Input download failures and a missing output image come back as an
    /// `error` envelope. Everything else that stops the job is a
    /// [`HandlerError`].
    pub async fn handle(
        &self,
        job_id: &str,
        raw_input: Option<&Value>,
    ) -> Result<HandlerOutput, HandlerError> {
        let input = validate_input(raw_input).map_err(|err| {
            let msg = match err {
                CoreError::Validation(msg) => msg,
                other => other.to_string(),
            };
            tracing::warn!(job_id, error = %msg, "Rejected job input");
            HandlerError::InvalidInput(msg)
        })?;

        let (report, manifest) = self.materializer.materialize(&input.image_manifest()).await;
        if !report.is_success() {
            tracing::warn!(
                job_id,
                failed = report.errors.len(),
                "Input images could not be saved"
            );
            return Ok(self.finish(report.into_handler_output()));
        }
        let input = input.with_manifest(&manifest);

        tracing::info!(job_id, "Running workflow");
        let outputs = self.runner.run(&input).await?;

        let output = match self.resolver.resolve(&outputs, job_id).await {
            Ok(artifact) => HandlerOutput::success(artifact.into_message()),
            Err(err @ (ArtifactError::Missing { .. } | ArtifactError::EmptyManifest)) => {
                HandlerOutput::error(err.to_string())
            }
            Err(err) => {
                tracing::error!(job_id, error = %err, "Failed to deliver generated image");
                return Err(HandlerError::Artifact(err));
            }
        };
        Ok(self.finish(output))
    }

    fn finish(&self, output: HandlerOutput) -> HandlerOutput {
        output.with_refresh_worker(self.refresh_worker)
    }
}
