//! `comfyrun-worker` -- inference-side job service.
//!
//! Waits for the local ComfyUI to answer, then serves the job API on a
//! loopback address. Each accepted job has its input images downloaded,
//! the workflow template run through ComfyUI, and the generated image
//! uploaded to a bucket or returned inline.
//!
//! See [`WorkerConfig::from_env`] for the environment variables.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::materializer::InputMaterializer;
use comfyrun_comfyui::readiness::ReadinessProbe;
use comfyrun_comfyui::resolver::ArtifactResolver;
use comfyrun_comfyui::storage::S3ArtifactStore;
use comfyrun_comfyui::workflow::ComfyUIWorkflowRunner;
use comfyrun_worker::config::WorkerConfig;
use comfyrun_worker::handler::JobHandler;
use comfyrun_worker::server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfyrun_worker=info,comfyrun_comfyui=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    let comfy_url = config.comfy_url();
    let probe = ReadinessProbe::new(
        config.api_available_max_retries,
        config.api_available_interval,
    );
    if !probe.probe(&comfy_url).await {
        tracing::error!(url = %comfy_url, "ComfyUI did not become reachable");
        std::process::exit(1);
    }
    tracing::info!(url = %comfy_url, "ComfyUI is reachable");

    let template = ComfyUIWorkflowRunner::load_template(&config.workflow_template_path)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to load workflow template");
            std::process::exit(1);
        });
    let runner = ComfyUIWorkflowRunner::new(ComfyUIApi::new(&comfy_url), template, config.polling);

    let mut resolver = ArtifactResolver::new(&config.output_path);
    if let Some(bucket) = &config.bucket {
        tracing::info!(
            endpoint = %bucket.endpoint_url,
            bucket = %bucket.bucket_name,
            "Generated images will be uploaded"
        );
        resolver = resolver.with_store(Arc::new(S3ArtifactStore::connect(bucket).await));
    }

    let handler = JobHandler::new(
        InputMaterializer::new(&config.input_path),
        Arc::new(runner),
        resolver,
    )
    .with_refresh_worker(config.refresh_worker);

    let cancel = CancellationToken::new();
    let (state, executor_handle) = server::start(Arc::new(handler), cancel.clone());
    let app = server::router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .unwrap_or_else(|_| {
            tracing::error!(host = %config.host, "HOST must be an IP address");
            std::process::exit(1);
        });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(%addr, error = %e, "Failed to bind job service");
            std::process::exit(1);
        });
    tracing::info!("Job service listening on {addr}");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    tracing::info!("Server stopped accepting connections, cleaning up");
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), executor_handle).await;
    tracing::info!("Job executor stopped");
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
