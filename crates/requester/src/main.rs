//! `comfyrun-requester` -- load generator and result collector.
//!
//! Posts the same job payload `--count` times, `--interval` seconds apart,
//! polls every job until it reaches a terminal status, saves decoded
//! outputs and writes one CSV row per job under
//! `<LOG_ROOT>/<YYYYmmdd_HHMMSS>/`.
//!
//! See [`RequesterConfig::from_env`] for the environment variables.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use comfyrun_comfyui::readiness::ReadinessProbe;
use comfyrun_comfyui::resolver::ArtifactResolver;
use comfyrun_requester::api::RemoteJobApi;
use comfyrun_requester::config::{Cli, RequesterConfig};
use comfyrun_requester::driver::{self, RunLayout};
use comfyrun_requester::outputs::OutputMaterializer;
use comfyrun_requester::poller::ResultPoller;
use comfyrun_requester::result_log::ResultLog;
use comfyrun_requester::submitter::JobSubmitter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyrun_requester=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = RequesterConfig::from_env().context("invalid configuration")?;

    let payload_text = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&payload_text)
        .with_context(|| format!("{} is not valid JSON", cli.input.display()))?;

    if let Some(readiness) = &config.readiness {
        let probe = ReadinessProbe::new(readiness.max_attempts, readiness.delay);
        if !probe.probe(&readiness.url).await {
            bail!("{} did not become ready", readiness.url);
        }
    }

    let layout = RunLayout::new(&config.log_root, &chrono::Local::now());
    layout
        .create()
        .await
        .with_context(|| format!("failed to create {}", layout.root.display()))?;
    let log = ResultLog::create(&layout.log_path).await?;

    tracing::info!(
        api_base = %config.api_base,
        count = cli.count,
        interval_secs = cli.interval,
        run_dir = %layout.root.display(),
        "Starting run",
    );

    let api = Arc::new(RemoteJobApi::new(&config.api_base, &config.api_key));
    let outputs = OutputMaterializer::new(ArtifactResolver::new(&config.comfy_output_path))
        .with_output_dir(&layout.output_dir);
    let (tracker, poller) = ResultPoller::new(api.clone(), outputs, log)
        .with_interval(config.check_interval)
        .spawn();
    let submitter = JobSubmitter::new(api, tracker);

    let report =
        driver::drive(submitter, poller, &payload, cli.count, cli.submit_interval()).await?;

    tracing::info!(
        submitted = report.submitted.len(),
        rejected = report.rejected,
        completed = report.summary.completed,
        failed = report.summary.failed,
        cancelled = report.summary.cancelled,
        log = %layout.log_path.display(),
        "Run finished",
    );
    Ok(())
}
