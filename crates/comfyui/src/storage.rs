//! Remote storage for generated artifacts.
//!
//! When a deployment configures a bucket endpoint, resolved images are
//! uploaded under `<job_id>/<filename>` and returned as a presigned URL
//! instead of being inlined into the job output.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use reqwest::Url;

/// Default lifetime of a presigned download URL (7 days, the S3 maximum).
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default region for S3-compatible endpoints that ignore it.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Errors from the artifact store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid bucket configuration: {0}")]
    Config(String),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {key} failed: {message}")]
    Upload { key: String, message: String },

    #[error("presigning {key} failed: {message}")]
    Presign { key: String, message: String },
}

/// Destination for generated files that should not travel inline.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload the file at `path` for `job_id` and return a fetchable reference.
    async fn upload(&self, job_id: &str, path: &Path) -> Result<String, StorageError>;
}

/// Object key for an uploaded artifact.
pub fn object_key(job_id: &str, path: &Path) -> String {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    if job_id.is_empty() {
        filename
    } else {
        format!("{job_id}/{filename}")
    }
}

// ---------------------------------------------------------------------------
// Bucket configuration
// ---------------------------------------------------------------------------

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Service endpoint the SDK talks to.
    pub endpoint_url: String,
    pub bucket_name: String,
    /// Path-style addressing (`endpoint/bucket/key`) instead of
    /// virtual-hosted (`bucket.endpoint/key`).
    pub path_style: bool,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub presign_expiry: Duration,
}

impl BucketConfig {
    /// Build from a bucket endpoint URL.
    ///
    /// With an explicit `bucket_name` the endpoint is used as-is with
    /// path-style addressing. Otherwise the endpoint is taken to be
    /// virtual-hosted (`https://<bucket>.s3.<region>.amazonaws.com`): the
    /// first host label is the bucket and the rest is the service endpoint.
    pub fn from_endpoint(
        endpoint_url: &str,
        bucket_name: Option<String>,
    ) -> Result<Self, StorageError> {
        let url = Url::parse(endpoint_url)
            .map_err(|e| StorageError::Config(format!("'{endpoint_url}': {e}")))?;

        let (endpoint_url, bucket_name, path_style) = match bucket_name {
            Some(bucket) if !bucket.trim().is_empty() => {
                (endpoint_url.trim_end_matches('/').to_string(), bucket, true)
            }
            _ => {
                let host = url.host_str().unwrap_or_default();
                let (bucket, service_host) = host.split_once('.').ok_or_else(|| {
                    StorageError::Config(format!(
                        "cannot derive a bucket name from host '{host}'; set BUCKET_NAME"
                    ))
                })?;
                let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
                let endpoint = format!("{}://{service_host}{port}", url.scheme());
                (endpoint, bucket.to_string(), false)
            }
        };

        Ok(Self {
            endpoint_url,
            bucket_name,
            path_style,
            region: DEFAULT_REGION.to_string(),
            access_key_id: None,
            secret_access_key: None,
            presign_expiry: DEFAULT_PRESIGN_EXPIRY,
        })
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }
}

// ---------------------------------------------------------------------------
// S3 store
// ---------------------------------------------------------------------------

/// [`ArtifactStore`] backed by the AWS S3 SDK.
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    presign_expiry: Duration,
}

impl S3ArtifactStore {
    /// Build an SDK client for `config`.
    ///
    /// Static credentials are used when both keys are configured; otherwise
    /// the default AWS provider chain applies.
    pub async fn connect(config: &BucketConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "comfyrun-static",
            ));
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        tracing::info!(
            endpoint = %config.endpoint_url,
            bucket = %config.bucket_name,
            path_style = config.path_style,
            "S3 artifact store configured",
        );

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket_name.clone(),
            presign_expiry: config.presign_expiry,
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(&self, job_id: &str, path: &Path) -> Result<String, StorageError> {
        let key = object_key(job_id, path);
        let bytes = tokio::fs::read(path).await.map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Upload {
                key: key.clone(),
                message: e.to_string(),
            })?;

        let presign = PresigningConfig::expires_in(self.presign_expiry).map_err(|e| {
            StorageError::Presign {
                key: key.clone(),
                message: e.to_string(),
            }
        })?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presign)
            .await
            .map_err(|e| StorageError::Presign {
                key: key.clone(),
                message: e.to_string(),
            })?;

        tracing::info!(job_id, key = %key, size, "Uploaded artifact to bucket");
        Ok(request.uri().to_string())
    }
}
