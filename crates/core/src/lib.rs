//! Shared domain types for the comfyrun workspace.
//!
//! Job lifecycle records, input/output manifests, resolved artifacts and
//! the worker's output envelope live here so that the worker and the
//! requester agree on a single wire shape.

pub mod error;
pub mod input;
pub mod job;
pub mod manifest;
pub mod output;
pub mod types;
