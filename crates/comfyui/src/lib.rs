//! ComfyUI-side building blocks for running generation jobs.
//!
//! Provides the ComfyUI REST wrapper, a bounded-retry readiness probe,
//! input materialization (remote URLs to local files), output artifact
//! resolution with optional S3 upload, and the workflow runner that
//! drives a template through a local ComfyUI instance.

pub mod api;
pub mod materializer;
pub mod readiness;
pub mod resolver;
pub mod storage;
pub mod workflow;
