use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use comfyrun_comfyui::storage::{BucketConfig, StorageError, DEFAULT_REGION};
use comfyrun_comfyui::workflow::PollPolicy;

/// Worker configuration loaded from environment variables.
///
/// Every field has a default suitable for a worker running next to a
/// local ComfyUI; bucket upload is enabled only when
/// `BUCKET_ENDPOINT_URL` is set.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// `host:port` of the local ComfyUI instance.
    pub comfy_host: String,
    /// Readiness probe policy for ComfyUI.
    pub api_available_interval: Duration,
    pub api_available_max_retries: u32,
    /// History polling policy while a workflow runs.
    pub polling: PollPolicy,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub workflow_template_path: PathBuf,
    /// Ask the platform for a clean worker after each job.
    pub refresh_worker: bool,
    pub bucket: Option<BucketConfig>,
    /// Bind address of the loopback job service.
    pub host: String,
    pub port: u16,
}

/// Invalid or unusable configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error(transparent)]
    Bucket(#[from] StorageError),
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default               |
    /// |------------------------------------|-----------------------|
    /// | `COMFY_HOST`                       | `127.0.0.1:8188`      |
    /// | `COMFY_API_AVAILABLE_INTERVAL_MS`  | `50`                  |
    /// | `COMFY_API_AVAILABLE_MAX_RETRIES`  | `500`                 |
    /// | `COMFY_POLLING_INTERVAL_MS`        | `250`                 |
    /// | `COMFY_POLLING_MAX_RETRIES`        | `500`                 |
    /// | `COMFY_INPUT_PATH`                 | `./ComfyUI/input`     |
    /// | `COMFY_OUTPUT_PATH`                | `./ComfyUI/output`    |
    /// | `WORKFLOW_TEMPLATE_PATH`           | `workflow_api.json`   |
    /// | `REFRESH_WORKER`                   | `false`               |
    /// | `BUCKET_ENDPOINT_URL`              | unset (inline output) |
    /// | `BUCKET_NAME`                      | derived from endpoint |
    /// | `BUCKET_ACCESS_KEY_ID`             | unset                 |
    /// | `BUCKET_SECRET_ACCESS_KEY`         | unset                 |
    /// | `BUCKET_REGION`                    | `us-east-1`           |
    /// | `HOST`                             | `127.0.0.1`           |
    /// | `PORT`                             | `8000`                |
    pub fn from_env() -> Result<Self, ConfigError> {
        let bucket = match non_empty_var("BUCKET_ENDPOINT_URL") {
            Some(endpoint) => {
                let mut bucket =
                    BucketConfig::from_endpoint(&endpoint, non_empty_var("BUCKET_NAME"))?
                        .with_region(
                            non_empty_var("BUCKET_REGION")
                                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
                        );
                if let (Some(key_id), Some(secret)) = (
                    non_empty_var("BUCKET_ACCESS_KEY_ID"),
                    non_empty_var("BUCKET_SECRET_ACCESS_KEY"),
                ) {
                    bucket = bucket.with_credentials(key_id, secret);
                }
                Some(bucket)
            }
            None => None,
        };

        Ok(Self {
            comfy_host: var_or("COMFY_HOST", "127.0.0.1:8188"),
            api_available_interval: Duration::from_millis(parse_var(
                "COMFY_API_AVAILABLE_INTERVAL_MS",
                50,
                "a number of milliseconds",
            )?),
            api_available_max_retries: parse_var(
                "COMFY_API_AVAILABLE_MAX_RETRIES",
                500,
                "a non-negative integer",
            )?,
            polling: PollPolicy {
                interval: Duration::from_millis(parse_var(
                    "COMFY_POLLING_INTERVAL_MS",
                    250,
                    "a number of milliseconds",
                )?),
                max_attempts: parse_var(
                    "COMFY_POLLING_MAX_RETRIES",
                    500,
                    "a non-negative integer",
                )?,
            },
            input_path: var_or("COMFY_INPUT_PATH", "./ComfyUI/input").into(),
            output_path: var_or("COMFY_OUTPUT_PATH", "./ComfyUI/output").into(),
            workflow_template_path: var_or("WORKFLOW_TEMPLATE_PATH", "workflow_api.json").into(),
            refresh_worker: var_or("REFRESH_WORKER", "false").eq_ignore_ascii_case("true"),
            bucket,
            host: var_or("HOST", "127.0.0.1"),
            port: parse_var("PORT", 8000, "a valid port number")?,
        })
    }

    /// Base HTTP URL of the local ComfyUI instance.
    pub fn comfy_url(&self) -> String {
        format!("http://{}", self.comfy_host)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    non_empty_var(name).unwrap_or_else(|| default.to_string())
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match non_empty_var(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value,
        }),
    }
}
