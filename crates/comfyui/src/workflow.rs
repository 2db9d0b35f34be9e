//! Run a generation workflow on the local ComfyUI instance.
//!
//! The workflow itself is opaque: a ComfyUI API-format JSON template whose
//! string leaves of the form `{{key}}` are replaced with the job input
//! value for `key`. The rendered prompt is queued with `POST /prompt` and
//! `GET /history/{prompt_id}` is polled until outputs appear or the
//! attempt budget is spent.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use comfyrun_core::input::JobInput;
use comfyrun_core::manifest::OutputManifest;
use serde_json::{Map, Value};

use crate::api::{ComfyUIApi, ComfyUIApiError, PromptHistory};

/// Errors from a workflow run.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid workflow template: {0}")]
    Template(String),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error("malformed history for prompt {prompt_id}: {source}")]
    History {
        prompt_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("prompt {prompt_id} failed during execution")]
    Execution { prompt_id: String },

    #[error("prompt {prompt_id} produced no outputs after {attempts} polls")]
    Timeout { prompt_id: String, attempts: u32 },
}

/// The local inference invocation: materialized input in, output manifest out.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, input: &JobInput) -> Result<OutputManifest, WorkflowError>;
}

/// How often and how many times to poll history.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            max_attempts: 500,
        }
    }
}

/// Replace every string leaf equal to `{{key}}` with `vars[key]`.
///
/// Placeholders without a matching variable are left untouched.
pub fn render_template(template: &Value, vars: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => s
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .and_then(|key| vars.get(key.trim()))
            .cloned()
            .unwrap_or_else(|| template.clone()),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| render_template(v, vars)).collect())
        }
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| (k.clone(), render_template(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Extract the output manifest for `prompt_id` from a `/history` response.
///
/// Returns `Ok(None)` while the prompt has not finished.
pub fn outputs_from_history(
    history: &PromptHistory,
    prompt_id: &str,
) -> Result<Option<OutputManifest>, WorkflowError> {
    let Some(entry) = history.get(prompt_id) else {
        return Ok(None);
    };

    if entry.failed() {
        return Err(WorkflowError::Execution {
            prompt_id: prompt_id.to_string(),
        });
    }

    match &entry.outputs {
        None => Ok(None),
        Some(outputs) => serde_json::from_value(outputs.clone())
            .map(Some)
            .map_err(|source| WorkflowError::History {
                prompt_id: prompt_id.to_string(),
                source,
            }),
    }
}

/// [`WorkflowRunner`] backed by a ComfyUI instance.
pub struct ComfyUIWorkflowRunner {
    api: ComfyUIApi,
    template: Value,
    poll: PollPolicy,
}

impl ComfyUIWorkflowRunner {
    pub fn new(api: ComfyUIApi, template: Value, poll: PollPolicy) -> Self {
        Self {
            api,
            template,
            poll,
        }
    }

    /// Read an API-format workflow template from disk.
    pub async fn load_template(path: &Path) -> Result<Value, WorkflowError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| WorkflowError::Template(format!("{}: {e}", path.display())))?;
        let template: Value = serde_json::from_str(&text)
            .map_err(|e| WorkflowError::Template(format!("{}: {e}", path.display())))?;
        if !template.is_object() {
            return Err(WorkflowError::Template(format!(
                "{}: expected a JSON object",
                path.display()
            )));
        }
        Ok(template)
    }

    fn render(&self, input: &JobInput) -> Result<Value, WorkflowError> {
        let vars = match serde_json::to_value(input) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(WorkflowError::Template("job input is not an object".into())),
            Err(e) => return Err(WorkflowError::Template(e.to_string())),
        };
        Ok(render_template(&self.template, &vars))
    }
}

#[async_trait]
impl WorkflowRunner for ComfyUIWorkflowRunner {
    async fn run(&self, input: &JobInput) -> Result<OutputManifest, WorkflowError> {
        let workflow = self.render(input)?;
        let client_id = uuid::Uuid::new_v4().to_string();
        let queued = self.api.submit_workflow(&workflow, &client_id).await?;
        let prompt_id = queued.prompt_id;

        tracing::info!(prompt_id = %prompt_id, queue_position = queued.number, "Workflow queued");

        for attempt in 1..=self.poll.max_attempts {
            match self.api.get_history(&prompt_id).await {
                Ok(history) => {
                    if let Some(manifest) = outputs_from_history(&history, &prompt_id)? {
                        tracing::info!(prompt_id = %prompt_id, attempt, "Workflow finished");
                        return Ok(manifest);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        prompt_id = %prompt_id,
                        attempt,
                        error = %e,
                        "History poll failed",
                    );
                }
            }
            tokio::time::sleep(self.poll.interval).await;
        }

        Err(WorkflowError::Timeout {
            prompt_id,
            attempts: self.poll.max_attempts,
        })
    }
}
