use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::api::RUNPOD_API_BASE;
use crate::poller::DEFAULT_CHECK_INTERVAL;

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "comfyrun-requester", about = "Submit generation jobs and log their results")]
pub struct Cli {
    /// Number of jobs to submit.
    #[arg(long, default_value_t = 10)]
    pub count: usize,

    /// Seconds to wait between submissions.
    #[arg(long, default_value_t = 1)]
    pub interval: u64,

    /// JSON file posted as the body of every job request.
    #[arg(long, default_value = "test_input.json")]
    pub input: PathBuf,
}

impl Cli {
    pub fn submit_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// Optional readiness check run before the first submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessConfig {
    pub url: String,
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Requester configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RequesterConfig {
    pub api_key: String,
    /// Job API base, e.g. `https://api.runpod.ai/v2/<endpoint_id>`.
    pub api_base: String,
    pub check_interval: Duration,
    pub log_root: PathBuf,
    /// Where manifest outputs are looked up when the worker shares a
    /// filesystem with the requester.
    pub comfy_output_path: PathBuf,
    pub readiness: Option<ReadinessConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl RequesterConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                                |
    /// |--------------------------|----------------------------------------|
    /// | `RUNPOD_API_KEY`         | required                               |
    /// | `RUNPOD_ENDPOINT_ID`     | required unless `RUNPOD_API_BASE` set  |
    /// | `RUNPOD_API_BASE`        | `https://api.runpod.ai/v2/{endpoint}`  |
    /// | `CHECK_INTERVAL_SECS`    | `5` (must be positive)                 |
    /// | `LOG_ROOT`               | `logs`                                 |
    /// | `COMFY_OUTPUT_PATH`      | `./ComfyUI/output`                     |
    /// | `READINESS_URL`          | unset (no probe)                       |
    /// | `READINESS_MAX_ATTEMPTS` | `10`                                   |
    /// | `READINESS_DELAY_MS`     | `1000`                                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = var("RUNPOD_API_KEY").ok_or(ConfigError::Missing("RUNPOD_API_KEY"))?;
        let api_base = match var("RUNPOD_API_BASE") {
            Some(base) => base,
            None => {
                let endpoint =
                    var("RUNPOD_ENDPOINT_ID").ok_or(ConfigError::Missing("RUNPOD_ENDPOINT_ID"))?;
                format!("{RUNPOD_API_BASE}/{endpoint}")
            }
        };

        let check_interval = match var("CHECK_INTERVAL_SECS") {
            Some(v) => {
                let secs: u64 = parse("CHECK_INTERVAL_SECS", v.clone(), POSITIVE_SECONDS)?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        name: "CHECK_INTERVAL_SECS",
                        expected: POSITIVE_SECONDS,
                        value: v,
                    });
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_CHECK_INTERVAL,
        };

        let readiness = match var("READINESS_URL") {
            Some(url) => Some(ReadinessConfig {
                url,
                max_attempts: var("READINESS_MAX_ATTEMPTS")
                    .map(|v| parse("READINESS_MAX_ATTEMPTS", v, "a non-negative integer"))
                    .transpose()?
                    .unwrap_or(10),
                delay: Duration::from_millis(
                    var("READINESS_DELAY_MS")
                        .map(|v| parse("READINESS_DELAY_MS", v, "a number of milliseconds"))
                        .transpose()?
                        .unwrap_or(1000),
                ),
            }),
            None => None,
        };

        Ok(Self {
            api_key,
            api_base,
            check_interval,
            log_root: var("LOG_ROOT").unwrap_or_else(|| "logs".into()).into(),
            comfy_output_path: var("COMFY_OUTPUT_PATH")
                .unwrap_or_else(|| "./ComfyUI/output".into())
                .into(),
            readiness,
        })
    }
}

const POSITIVE_SECONDS: &str = "a positive number of seconds";

fn parse<T: FromStr>(
    name: &'static str,
    value: String,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, expected, value })
}
