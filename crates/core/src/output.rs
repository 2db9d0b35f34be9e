//! Resolved artifacts and the worker's job output envelope.

use serde::{Deserialize, Serialize};

/// `success` / `error` marker shared by the handler output and the input
/// materialization report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// The resolved representation of a completed job's primary output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Uploaded to remote storage; `url` is publicly fetchable.
    Remote { url: String },
    /// Standard-alphabet base64 of the file bytes.
    Inline { data: String },
}

impl Artifact {
    /// The string placed in [`HandlerOutput::message`].
    pub fn into_message(self) -> String {
        match self {
            Self::Remote { url } => url,
            Self::Inline { data } => data,
        }
    }
}

/// What a worker returns as a job's `output`.
///
/// On success `message` is either an uploaded URL or an inline base64
/// payload. On error it is a human-readable reason and `details` may carry
/// an itemized breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub status: ReportStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub refresh_worker: bool,
}

impl HandlerOutput {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Success,
            message: message.into(),
            details: None,
            refresh_worker: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Error,
            message: message.into(),
            details: None,
            refresh_worker: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_refresh_worker(mut self, refresh_worker: bool) -> Self {
        self.refresh_worker = refresh_worker;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_output_wire_shape() {
        let out = HandlerOutput::success("aGVsbG8=").with_refresh_worker(true);
        let json = serde_json::to_value(&out).unwrap();

        assert_eq!(json["status"], "success");
        assert_eq!(json["message"], "aGVsbG8=");
        assert_eq!(json["refresh_worker"], true);
        assert!(json.get("details").is_none());
    }

    #[test]
    fn handler_output_accepts_missing_optional_fields() {
        let out: HandlerOutput =
            serde_json::from_value(serde_json::json!({"status": "error", "message": "boom"}))
                .unwrap();
        assert!(!out.is_success());
        assert!(!out.refresh_worker);
        assert!(out.details.is_none());
    }

    #[test]
    fn artifact_message_is_url_or_payload() {
        let remote = Artifact::Remote { url: "https://b/x.png".into() };
        let inline = Artifact::Inline { data: "AAEC".into() };
        assert_eq!(remote.into_message(), "https://b/x.png");
        assert_eq!(inline.into_message(), "AAEC");
    }
}
