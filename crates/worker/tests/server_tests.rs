//! Integration tests for the loopback job service, driven through
//! `tower::ServiceExt::oneshot` with a fake workflow runner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use comfyrun_comfyui::materializer::InputMaterializer;
use comfyrun_comfyui::resolver::ArtifactResolver;
use comfyrun_comfyui::workflow::{WorkflowError, WorkflowRunner};
use comfyrun_core::input::JobInput;
use comfyrun_core::manifest::{ImageRef, NodeOutput, OutputManifest};
use comfyrun_worker::handler::JobHandler;
use comfyrun_worker::server;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Produces `result.png` once released; signals when a run starts.
#[derive(Default)]
struct GatedRunner {
    gated: bool,
    started: Notify,
    release: Notify,
}

#[async_trait]
impl WorkflowRunner for GatedRunner {
    async fn run(&self, _input: &JobInput) -> Result<OutputManifest, WorkflowError> {
        self.started.notify_one();
        if self.gated {
            self.release.notified().await;
        }
        let mut manifest = OutputManifest::default();
        manifest.0.insert(
            "9".into(),
            NodeOutput {
                images: vec![ImageRef {
                    filename: "result.png".into(),
                    subfolder: String::new(),
                    kind: Some("output".into()),
                }],
            },
        );
        Ok(manifest)
    }
}

fn app(output_root: &Path, runner: Arc<GatedRunner>) -> Router {
    let handler = JobHandler::new(
        InputMaterializer::new(output_root.join("input")),
        runner,
        ArtifactResolver::new(output_root),
    );
    let (state, _executor) = server::start(Arc::new(handler), CancellationToken::new());
    server::router(state)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn wait_terminal(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = send(app, "GET", &format!("/status/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(body["status"].as_str(), Some("COMPLETED" | "FAILED" | "CANCELLED")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached a terminal status");
}

fn valid_input() -> Value {
    json!({
        "input": {
            "base_image": "base.png",
            "reference_image": "ref.png",
            "mask_image": "mask.png",
            "use_background_remove": true
        }
    })
}

// ---------------------------------------------------------------------------
// Test: /run then /status reaches COMPLETED with the handler output
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_then_status_completes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("result.png"), b"generated").unwrap();
    let app = app(dir.path(), Arc::new(GatedRunner::default()));

    let (status, accepted) = send(&app, "POST", "/run", Some(valid_input())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["status"], "IN_QUEUE");
    let id = accepted["id"].as_str().unwrap().to_string();

    let job = wait_terminal(&app, &id).await;
    assert_eq!(job["status"], "COMPLETED");
    assert_eq!(job["output"]["status"], "success");
    // base64("generated")
    assert_eq!(job["output"]["message"], "Z2VuZXJhdGVk");
    assert!(job.get("error").is_none());
}

// ---------------------------------------------------------------------------
// Test: invalid input fails the job with the validation message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_input_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Arc::new(GatedRunner::default()));

    let body = json!({"input": {"base_image": "a.png", "reference_image": "b.png"}});
    let (_, accepted) = send(&app, "POST", "/run", Some(body)).await;
    let id = accepted["id"].as_str().unwrap().to_string();

    let job = wait_terminal(&app, &id).await;
    assert_eq!(job["status"], "FAILED");
    assert_eq!(job["error"], "Missing 'mask_image' in input");
    assert!(job.get("output").is_none());
}

// ---------------------------------------------------------------------------
// Test: unknown ids and non-object bodies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Arc::new(GatedRunner::default()));

    let (status, body) = send(&app, "GET", "/status/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(&app, "POST", "/cancel/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, "POST", "/run", Some(json!([1, 2]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

// ---------------------------------------------------------------------------
// Test: only queued jobs can be cancelled; jobs run one at a time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_only_applies_to_queued_jobs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("result.png"), b"generated").unwrap();
    let runner = Arc::new(GatedRunner {
        gated: true,
        ..Default::default()
    });
    let app = app(dir.path(), runner.clone());

    let (_, first) = send(&app, "POST", "/run", Some(valid_input())).await;
    let first = first["id"].as_str().unwrap().to_string();
    runner.started.notified().await;

    let (_, second) = send(&app, "POST", "/run", Some(valid_input())).await;
    let second = second["id"].as_str().unwrap().to_string();

    let (_, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["jobs"]["in_progress"], 1);
    assert_eq!(health["jobs"]["in_queue"], 1);

    let (status, body) = send(&app, "POST", &format!("/cancel/{first}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, body) = send(&app, "POST", &format!("/cancel/{second}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");

    runner.release.notify_one();
    let job = wait_terminal(&app, &first).await;
    assert_eq!(job["status"], "COMPLETED");

    let (_, job) = send(&app, "GET", &format!("/status/{second}"), None).await;
    assert_eq!(job["status"], "CANCELLED");
    assert!(job.get("output").is_none());
}
