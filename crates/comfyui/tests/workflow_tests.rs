//! Integration tests for the ComfyUI workflow runner against a fake
//! ComfyUI HTTP server.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::workflow::{ComfyUIWorkflowRunner, PollPolicy, WorkflowError, WorkflowRunner};
use comfyrun_core::input::JobInput;
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct FakeComfy {
    /// Last prompt body received on `/prompt`.
    submitted: Arc<Mutex<Option<Value>>>,
    history_calls: Arc<AtomicU32>,
    /// History polls answered with an empty object before outputs appear.
    ready_after: u32,
}

async fn queue_prompt(State(fake): State<FakeComfy>, Json(body): Json<Value>) -> Json<Value> {
    *fake.submitted.lock().unwrap() = Some(body);
    Json(json!({"prompt_id": "prompt-1", "number": 0, "node_errors": {}}))
}

async fn history(State(fake): State<FakeComfy>, Path(prompt_id): Path<String>) -> Json<Value> {
    let n = fake.history_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if n <= fake.ready_after {
        return Json(json!({}));
    }
    let mut body = serde_json::Map::new();
    body.insert(
        prompt_id,
        json!({
            "status": {"status_str": "success", "completed": true},
            "outputs": {"9": {"images": [
                {"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"}
            ]}}
        }),
    );
    Json(Value::Object(body))
}

async fn fake_comfy(ready_after: u32) -> (String, FakeComfy) {
    let fake = FakeComfy {
        ready_after,
        ..Default::default()
    };
    let router = Router::new()
        .route("/prompt", post(queue_prompt))
        .route("/history/{prompt_id}", get(history))
        .with_state(fake.clone());
    (common::serve(router).await, fake)
}

fn input() -> JobInput {
    JobInput {
        base_image: "base.png".into(),
        reference_image: "ref.png".into(),
        mask_image: "mask.png".into(),
        use_background_remove: false,
    }
}

fn template() -> Value {
    json!({
        "10": {"class_type": "LoadImage", "inputs": {"image": "{{base_image}}"}},
        "11": {"class_type": "LoadImage", "inputs": {"image": "{{mask_image}}"}},
        "20": {"class_type": "Switch", "inputs": {"enabled": "{{use_background_remove}}"}}
    })
}

fn fast_poll(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(5),
        max_attempts,
    }
}

// ---------------------------------------------------------------------------
// Test: template is rendered, submitted, and history polled until outputs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runs_workflow_until_outputs_appear() {
    let (url, fake) = fake_comfy(2).await;
    let runner = ComfyUIWorkflowRunner::new(ComfyUIApi::new(url), template(), fast_poll(10));

    let manifest = runner.run(&input()).await.expect("workflow should finish");

    assert_eq!(manifest.last_image().unwrap().filename, "ComfyUI_00001_.png");
    assert_eq!(fake.history_calls.load(Ordering::SeqCst), 3);

    let submitted = fake.submitted.lock().unwrap().clone().expect("prompt submitted");
    assert_eq!(submitted["prompt"]["10"]["inputs"]["image"], "base.png");
    assert_eq!(submitted["prompt"]["11"]["inputs"]["image"], "mask.png");
    assert_eq!(submitted["prompt"]["20"]["inputs"]["enabled"], false);
    assert!(submitted["client_id"].is_string());
}

// ---------------------------------------------------------------------------
// Test: attempt budget is enforced
// ---------------------------------------------------------------------------

#[tokio::test]
async fn times_out_after_max_attempts() {
    let (url, fake) = fake_comfy(u32::MAX).await;
    let runner = ComfyUIWorkflowRunner::new(ComfyUIApi::new(url), template(), fast_poll(3));

    let result = runner.run(&input()).await;

    assert_matches!(result, Err(WorkflowError::Timeout { attempts: 3, .. }));
    assert_eq!(fake.history_calls.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Test: submission failure surfaces as an API error
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_comfyui_is_api_error() {
    let runner = ComfyUIWorkflowRunner::new(
        ComfyUIApi::new(common::UNREACHABLE),
        template(),
        fast_poll(1),
    );
    assert_matches!(runner.run(&input()).await, Err(WorkflowError::Api(_)));
}

// ---------------------------------------------------------------------------
// Test: templates are loaded from disk and must be objects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_template_validates_shape() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let good = dir.path().join("workflow_api.json");
    let bad = dir.path().join("list.json");
    std::fs::write(&good, template().to_string()).unwrap();
    std::fs::write(&bad, "[1, 2]").unwrap();

    let loaded = ComfyUIWorkflowRunner::load_template(&good).await.unwrap();
    assert_eq!(loaded, template());
    assert_matches!(
        ComfyUIWorkflowRunner::load_template(&bad).await,
        Err(WorkflowError::Template(_))
    );
    assert_matches!(
        ComfyUIWorkflowRunner::load_template(&dir.path().join("missing.json")).await,
        Err(WorkflowError::Template(_))
    );
}
