//! Download remote job inputs into the local ComfyUI input folder.
//!
//! Every URL reference in an [`InputManifest`] is fetched and written
//! under the configured input root, and the reference is rewritten to the
//! bare filename ComfyUI loads from that folder. A failing item is
//! recorded in the report and processing continues with the next key.

use std::path::{Path, PathBuf};

use comfyrun_core::manifest::InputManifest;
use comfyrun_core::output::{HandlerOutput, ReportStatus};
use reqwest::Url;
use serde::Serialize;

/// Extension used when a URL path has no usable basename.
pub const DEFAULT_EXTENSION: &str = "png";

/// One input written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedInput {
    pub key: String,
    pub name: String,
    pub path: PathBuf,
}

/// One input that could not be materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputFailure {
    pub key: String,
    pub error: String,
}

/// Outcome of a materialization pass.
#[derive(Debug, Clone, Serialize)]
pub struct MaterializeReport {
    /// `error` if any item failed.
    pub status: ReportStatus,
    pub message: String,
    pub saved: Vec<SavedInput>,
    pub errors: Vec<InputFailure>,
}

impl MaterializeReport {
    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }

    /// Convert into the job output returned when materialization blocks a job.
    pub fn into_handler_output(self) -> HandlerOutput {
        let details = serde_json::json!({
            "saved": self.saved,
            "errors": self.errors,
        });
        let output = match self.status {
            ReportStatus::Success => HandlerOutput::success(self.message),
            ReportStatus::Error => HandlerOutput::error(self.message),
        };
        output.with_details(details)
    }
}

/// Per-item failure while materializing an input.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Downloads URL inputs into a local folder.
#[derive(Debug, Clone)]
pub struct InputMaterializer {
    client: reqwest::Client,
    input_root: PathBuf,
    default_extension: String,
}

impl InputMaterializer {
    pub fn new(input_root: impl Into<PathBuf>) -> Self {
        Self::with_client(reqwest::Client::new(), input_root)
    }

    pub fn with_client(client: reqwest::Client, input_root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            input_root: input_root.into(),
            default_extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    pub fn input_root(&self) -> &Path {
        &self.input_root
    }

    /// Materialize every URL reference in `manifest`.
    ///
    /// Returns the report and a copy of the manifest in which each
    /// successfully saved key points at its local filename. Keys that are
    /// not URLs, or that failed, keep their original value.
    pub async fn materialize(
        &self,
        manifest: &InputManifest,
    ) -> (MaterializeReport, InputManifest) {
        if manifest.is_empty() {
            let report = MaterializeReport {
                status: ReportStatus::Success,
                message: "No images to save".to_string(),
                saved: Vec::new(),
                errors: Vec::new(),
            };
            return (report, manifest.clone());
        }

        let mut updated = manifest.clone();
        let mut saved = Vec::new();
        let mut errors = Vec::new();

        for (key, reference) in manifest.iter() {
            let Some(url) = parse_remote(reference) else {
                tracing::debug!(key, "Input is not a remote URL, leaving unchanged");
                continue;
            };

            match self.materialize_one(key, &url).await {
                Ok(item) => {
                    tracing::info!(key, path = %item.path.display(), "Saved input image");
                    updated.insert(key, item.name.clone());
                    saved.push(item);
                }
                Err(e) => {
                    tracing::warn!(key, url = %url, error = %e, "Failed to save input image");
                    errors.push(InputFailure {
                        key: key.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let report = if errors.is_empty() {
            MaterializeReport {
                status: ReportStatus::Success,
                message: "All images saved successfully".to_string(),
                saved,
                errors,
            }
        } else {
            MaterializeReport {
                status: ReportStatus::Error,
                message: "Some images failed to save".to_string(),
                saved,
                errors,
            }
        };

        (report, updated)
    }

    async fn materialize_one(&self, key: &str, url: &Url) -> Result<SavedInput, MaterializeError> {
        let name = local_filename(key, url, &self.default_extension);
        let path = self.input_root.join(&name);

        let bytes = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let write_err = |source| MaterializeError::Write {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.input_root)
            .await
            .map_err(write_err)?;
        tokio::fs::write(&path, &bytes).await.map_err(write_err)?;

        Ok(SavedInput {
            key: key.to_string(),
            name,
            path,
        })
    }
}

/// Local filename for a downloaded input: the URL path basename, or
/// `<key>.<default_extension>` when the path has none.
pub fn local_filename(key: &str, url: &Url, default_extension: &str) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{key}.{default_extension}"))
}

fn parse_remote(reference: &str) -> Option<Url> {
    Url::parse(reference)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn filename_from_path_basename() {
        assert_eq!(
            local_filename("base_image", &url("https://cdn.example/a/b/photo.jpg?sig=1"), "png"),
            "photo.jpg"
        );
    }

    #[test]
    fn filename_falls_back_to_key() {
        assert_eq!(
            local_filename("mask_image", &url("https://cdn.example/"), "png"),
            "mask_image.png"
        );
        assert_eq!(
            local_filename("mask_image", &url("https://cdn.example"), "webp"),
            "mask_image.webp"
        );
        assert_eq!(local_filename("k", &url("https://cdn.example/dir/"), "png"), "k.png");
    }

    #[test]
    fn only_http_urls_are_remote() {
        assert!(parse_remote("https://x/y.png").is_some());
        assert!(parse_remote("http://x/y.png").is_some());
        assert!(parse_remote("base.png").is_none());
        assert!(parse_remote("file:///etc/passwd").is_none());
    }

    #[tokio::test]
    async fn empty_manifest_is_success() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let materializer = InputMaterializer::new(dir.path());
        let (report, updated) = materializer.materialize(&InputManifest::new()).await;

        assert!(report.is_success());
        assert_eq!(report.message, "No images to save");
        assert!(updated.is_empty());
    }

    #[tokio::test]
    async fn local_references_are_left_alone() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let materializer = InputMaterializer::new(dir.path());
        let manifest: InputManifest = [("base_image", "already-local.png")].into_iter().collect();

        let (report, updated) = materializer.materialize(&manifest).await;
        assert!(report.is_success());
        assert!(report.saved.is_empty());
        assert_eq!(updated, manifest);
    }

    #[test]
    fn failed_report_becomes_error_output_with_details() {
        let report = MaterializeReport {
            status: ReportStatus::Error,
            message: "Some images failed to save".into(),
            saved: vec![],
            errors: vec![InputFailure {
                key: "mask_image".into(),
                error: "download failed: 404".into(),
            }],
        };
        let output = report.into_handler_output();

        assert!(!output.is_success());
        let details = output.details.unwrap();
        assert_eq!(details["errors"][0]["key"], "mask_image");
        assert!(details["saved"].as_array().unwrap().is_empty());
    }
}
