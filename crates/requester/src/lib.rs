//! `comfyrun-requester` library crate.
//!
//! Job API client, submitter, result poller and result log. The binary
//! entrypoint lives in `main.rs`.

pub mod api;
pub mod config;
pub mod driver;
pub mod outputs;
pub mod poller;
pub mod result_log;
pub mod state;
pub mod submitter;
