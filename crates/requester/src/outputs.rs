//! Turn a completed job's `output` into a [`ResultRef`].
//!
//! Accepted shapes, tried in order:
//!
//! 1. a worker envelope `{status, message}`; an `error` envelope fails the
//!    job, a `success` message is a URL or a base64 payload;
//! 2. an [`Artifact`] (`{"kind": "remote" | "inline", ...}`);
//! 3. an [`OutputManifest`], optionally wrapped in `{"outputs": ...}`,
//!    resolved against the local output root;
//! 4. a bare string, read like an envelope message.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use comfyrun_comfyui::resolver::{ArtifactError, ArtifactResolver};
use comfyrun_core::job::ResultRef;
use comfyrun_core::manifest::OutputManifest;
use comfyrun_core::output::{Artifact, HandlerOutput, ReportStatus};
use serde_json::Value;

/// Extension used when the decoded bytes are not a recognized image.
pub const FALLBACK_EXTENSION: &str = "jpg";

/// Why a completed job's output could not be materialized.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("job completed without output")]
    Missing,

    /// The worker reported an error envelope.
    #[error("{0}")]
    Remote(String),

    #[error("unrecognized job output: {0}")]
    Unrecognized(String),

    #[error("output is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Materializes completed job outputs.
pub struct OutputMaterializer {
    resolver: ArtifactResolver,
    output_dir: Option<PathBuf>,
}

impl OutputMaterializer {
    /// Inline payloads are kept as [`ResultRef::Inline`] until
    /// [`with_output_dir`](Self::with_output_dir) is set.
    pub fn new(resolver: ArtifactResolver) -> Self {
        Self {
            resolver,
            output_dir: None,
        }
    }

    /// Decode inline payloads into `<dir>/<job_id>.<ext>`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub async fn materialize(
        &self,
        job_id: &str,
        output: Option<&Value>,
    ) -> Result<ResultRef, OutputError> {
        let output = match output {
            None | Some(Value::Null) => return Err(OutputError::Missing),
            Some(value) => value,
        };

        if let Ok(envelope) = serde_json::from_value::<HandlerOutput>(output.clone()) {
            return match envelope.status {
                ReportStatus::Error => Err(OutputError::Remote(envelope.message)),
                ReportStatus::Success => self.message_ref(job_id, &envelope.message).await,
            };
        }

        if let Ok(artifact) = serde_json::from_value::<Artifact>(output.clone()) {
            return self.artifact_ref(job_id, artifact).await;
        }

        let manifest_value = output.get("outputs").unwrap_or(output);
        if let Ok(manifest) = serde_json::from_value::<OutputManifest>(manifest_value.clone()) {
            let artifact = self.resolver.resolve(&manifest, job_id).await?;
            return self.artifact_ref(job_id, artifact).await;
        }

        match output {
            Value::String(message) => self.message_ref(job_id, message).await,
            other => Err(OutputError::Unrecognized(truncate(&other.to_string(), 120))),
        }
    }

    async fn artifact_ref(
        &self,
        job_id: &str,
        artifact: Artifact,
    ) -> Result<ResultRef, OutputError> {
        match artifact {
            Artifact::Remote { url } => Ok(ResultRef::RemoteUrl(url)),
            Artifact::Inline { data } => self.inline_ref(job_id, data).await,
        }
    }

    async fn message_ref(&self, job_id: &str, message: &str) -> Result<ResultRef, OutputError> {
        let message = message.trim();
        if message.starts_with("http://") || message.starts_with("https://") {
            return Ok(ResultRef::RemoteUrl(message.to_string()));
        }
        self.inline_ref(job_id, message.to_string()).await
    }

    async fn inline_ref(&self, job_id: &str, data: String) -> Result<ResultRef, OutputError> {
        let Some(dir) = &self.output_dir else {
            return Ok(ResultRef::Inline(data));
        };

        let bytes = BASE64.decode(strip_data_uri(&data))?;
        let path = dir.join(format!("{}.{}", file_stem(job_id), extension_for(&bytes)));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| OutputError::Write {
                path: dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| OutputError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::info!(job_id, path = %path.display(), size = bytes.len(), "Saved job output");
        Ok(ResultRef::LocalPath(path))
    }
}

/// File extension for decoded output bytes.
pub fn extension_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or(FALLBACK_EXTENSION)
}

/// File name stem for a job id issued by the remote service.
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`, so the saved file always
/// lands directly inside the output directory.
pub fn file_stem(job_id: &str) -> String {
    let stem: String = job_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "output".to_string()
    } else {
        stem
    }
}

/// `data:image/png;base64,AAAA` -> `AAAA`.
fn strip_data_uri(data: &str) -> &str {
    match data.split_once(";base64,") {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => data,
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
