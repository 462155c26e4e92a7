use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transcript_processor::{
    BulkUploadWorker, ChatCompletionAnalyzer, Config, DrainSettings, ObjectTransfer,
    PipelineOrchestrator, ResultStore, S3ObjectStore, SqsWorkQueue,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting transcript processor"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let queue = Arc::new(SqsWorkQueue::new(&config.queue).await);
    let store = Arc::new(S3ObjectStore::new(&config.storage).await);
    let transfer = Arc::new(ObjectTransfer::new(store, config.storage.staging_dir.clone()));
    let analyzer = Arc::new(
        ChatCompletionAnalyzer::new(&config.analysis)
            .context("Failed to initialize analysis client")?,
    );
    let results = ResultStore::new(
        config.results.data_dir.clone(),
        config.results.mode,
        transfer.clone(),
    );

    let shutdown = CancellationToken::new();

    // Spawn bulk upload worker
    let (worker, uploads) = BulkUploadWorker::new(
        transfer.clone(),
        config.upload_worker.bucket.clone(),
        config.upload_cooldown(),
        shutdown.clone(),
    );
    let worker_handle = worker.spawn();

    let mut orchestrator = PipelineOrchestrator::new(
        queue,
        transfer,
        analyzer,
        results,
        DrainSettings::from_config(&config),
    );
    if config.upload_worker.mirror_results {
        info!(bucket = %config.upload_worker.bucket, "Mirroring result directories");
        orchestrator = orchestrator.with_upload_queue(uploads);
    }

    // Spawn drain trigger task
    let drain_interval = config.drain_interval();
    let drain_shutdown = shutdown.clone();
    let drain_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = drain_shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = orchestrator.drain().await {
                        error!(error = %e, "Drain cycle aborted");
                    }
                }
            }
        }
    });

    info!("Transcript processor started");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down transcript processor");

    shutdown.cancel();
    if let Err(e) = drain_handle.await {
        error!(error = %e, "Drain task ended abnormally");
    }
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Upload worker ended abnormally");
    }

    info!("Transcript processor stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
