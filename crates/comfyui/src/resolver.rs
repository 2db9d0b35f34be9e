//! Locate a completed job's generated image and turn it into an [`Artifact`].
//!
//! The image is looked up under the local ComfyUI output root. Whether it
//! is uploaded or inlined is fixed when the resolver is built: a resolver
//! with an [`ArtifactStore`] always uploads, one without always inlines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use comfyrun_core::manifest::{ImageRef, OutputManifest};
use comfyrun_core::output::Artifact;

use crate::storage::{ArtifactStore, StorageError};

/// Errors from artifact resolution.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The manifest names a file that is not on disk.
    #[error("the image does not exist in the specified output folder: {}", path.display())]
    Missing { path: PathBuf },

    #[error("the output manifest contains no images")]
    EmptyManifest,

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Upload(#[from] StorageError),
}

/// Resolves output manifests against a local output root.
#[derive(Clone)]
pub struct ArtifactResolver {
    output_root: PathBuf,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl ArtifactResolver {
    /// A resolver that returns inline base64 artifacts.
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            store: None,
        }
    }

    /// Upload resolved files to `store` instead of inlining them.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn uploads(&self) -> bool {
        self.store.is_some()
    }

    /// `<output_root>/<subfolder>/<filename>`; an empty subfolder is skipped.
    pub fn expected_path(&self, image: &ImageRef) -> PathBuf {
        let mut path = self.output_root.clone();
        if !image.subfolder.is_empty() {
            path.push(&image.subfolder);
        }
        path.push(&image.filename);
        path
    }

    /// Resolve the manifest's last image for `job_id`.
    ///
    /// When the manifest lists several images only the last one is
    /// materialized.
    pub async fn resolve(
        &self,
        manifest: &OutputManifest,
        job_id: &str,
    ) -> Result<Artifact, ArtifactError> {
        let image = manifest.last_image().ok_or(ArtifactError::EmptyManifest)?;
        let path = self.expected_path(image);
        tracing::debug!(job_id, path = %path.display(), "Resolving generated image");

        if !matches!(tokio::fs::try_exists(&path).await, Ok(true)) {
            tracing::warn!(
                job_id,
                path = %path.display(),
                "Generated image missing from output folder",
            );
            return Err(ArtifactError::Missing { path });
        }

        match &self.store {
            Some(store) => {
                let url = store.upload(job_id, &path).await?;
                tracing::info!(job_id, "Image generated and uploaded to remote storage");
                Ok(Artifact::Remote { url })
            }
            None => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|source| ArtifactError::Read {
                        path: path.clone(),
                        source,
                    })?;
                tracing::info!(job_id, size = bytes.len(), "Image generated and encoded inline");
                Ok(Artifact::Inline {
                    data: BASE64.encode(bytes),
                })
            }
        }
    }
}
