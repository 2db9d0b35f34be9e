//! Client for the remote job API.
//!
//! Two endpoints are used: `POST {base}/run` to create a job and
//! `GET {base}/status/{id}` to poll it. Every request carries the static
//! bearer credential.

use async_trait::async_trait;
use comfyrun_core::job::JobStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default base URL template; `{endpoint_id}` is substituted.
pub const RUNPOD_API_BASE: &str = "https://api.runpod.ai/v2";

/// Errors from the remote job API layer.
#[derive(Debug, thiserror::Error)]
pub enum RemoteApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("job API error ({status}): {body}")]
    ApiError { status: u16, body: String },
}

/// Remote job status as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    InQueue,
    InProgress,
    Pending,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// Anything else the service may report; treated as still running.
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    /// Local lifecycle status this remote status maps to.
    pub fn job_status(self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed | Self::TimedOut => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
            Self::InQueue | Self::InProgress | Self::Pending | Self::Unknown => JobStatus::Pending,
        }
    }
}

/// Body of a `POST /run` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<RemoteStatus>,
}

/// Body of a `GET /status/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: RemoteStatus,
    #[serde(default)]
    pub output: Option<Value>,
    /// Error text; some deployments send an object here.
    #[serde(default)]
    pub error: Option<Value>,
}

impl StatusResponse {
    pub fn new(id: impl Into<String>, status: RemoteStatus) -> Self {
        Self {
            id: Some(id.into()),
            status,
            output: None,
            error: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Value::String(error.into()));
        self
    }

    /// The error field as text, if present.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Operations the requester needs from a job service.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Create a job from `payload`.
    async fn run(&self, payload: &Value) -> Result<RunResponse, RemoteApiError>;

    /// Fetch the current status of `job_id`.
    async fn status(&self, job_id: &str) -> Result<StatusResponse, RemoteApiError>;
}

/// HTTP client for the remote job API.
#[derive(Clone)]
pub struct RemoteJobApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteJobApi {
    /// * `base_url` - e.g. `https://api.runpod.ai/v2/<endpoint_id>`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, api_key)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ---- private helpers ----

    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RemoteApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl JobApi for RemoteJobApi {
    async fn run(&self, payload: &Value) -> Result<RunResponse, RemoteApiError> {
        let response = self
            .client
            .post(format!("{}/run", self.base_url))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, RemoteApiError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.base_url, job_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn remote_statuses_map_to_lifecycle() {
        let cases = [
            ("IN_QUEUE", JobStatus::Pending),
            ("IN_PROGRESS", JobStatus::Pending),
            ("COMPLETED", JobStatus::Completed),
            ("FAILED", JobStatus::Failed),
            ("TIMED_OUT", JobStatus::Failed),
            ("CANCELLED", JobStatus::Cancelled),
            ("SOMETHING_NEW", JobStatus::Pending),
        ];
        for (wire, expected) in cases {
            let status: RemoteStatus = serde_json::from_value(json!(wire)).unwrap();
            assert_eq!(status.job_status(), expected, "{wire}");
        }
    }

    #[test]
    fn status_response_error_text() {
        let parsed: StatusResponse = serde_json::from_value(json!({
            "id": "abc123",
            "status": "FAILED",
            "error": {"error_type": "OOM"}
        }))
        .unwrap();
        assert_eq!(parsed.error_message().as_deref(), Some(r#"{"error_type":"OOM"}"#));

        let plain = StatusResponse::new("abc123", RemoteStatus::Failed).with_error("boom");
        assert_eq!(plain.error_message().as_deref(), Some("boom"));
        assert_eq!(StatusResponse::new("x", RemoteStatus::Completed).error_message(), None);
    }

    #[test]
    fn run_response_tolerates_missing_id() {
        let parsed: RunResponse = serde_json::from_value(json!({"status": "IN_QUEUE"})).unwrap();
        assert!(parsed.id.is_none());
        assert_eq!(parsed.status, Some(RemoteStatus::InQueue));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = RemoteJobApi::new("http://127.0.0.1:8000/", "key");
        assert_eq!(api.base_url(), "http://127.0.0.1:8000");
    }
}
