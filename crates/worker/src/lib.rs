//! `comfyrun-worker` library crate.
//!
//! The job handler and the loopback job service. The binary entrypoint
//! lives in `main.rs`.

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
