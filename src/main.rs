//! Convert Worker Service
//!
//! Consumes document and video conversion tasks from RabbitMQ and delivers the
//! converted files to each task's callback URL.
//!
//! ## Architecture
//!
//! - **Queues**: one durable work queue per logical name, dead-lettered to `<queue>_dead`
//! - **Workers**: `CONVERT_WORKER_REPLICAS` consumers per queue, one task at a time each
//! - **Converters**: libreoffice, ImageMagick and ffmpeg as child processes
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables (a `.env` file is honored):
//! - `RABBITMQ_USER`, `RABBITMQ_PASSWORD`, `RABBITMQ_HOST`, `RABBITMQ_PORT`
//! - `CONVERT_SUCCESS_DIRECTORY`, `CONVERT_DOWNLOAD_DIRECTORY`
//! - `CONVERT_MAX_VIDEO_SIZE`, `CONVERT_MAX_DOCUMENT_SIZE`
//! - `CONVERT_ENV`: `local`, `dev` or `prod` (default: local)
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker_convert::broker::{AmqpBroker, ConnectionManager};
use worker_convert::config::Config;
use worker_convert::handler::TaskDispatcher;
use worker_convert::shutdown::wait_for_signal;
use worker_convert::telemetry;
use worker_convert::tools::ProcessRunner;
use worker_convert::transfer::http_client;
use worker_convert::worker::{PoolOptions, ShutdownOutcome, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_logging(config.env);

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(
        env = ?config.env,
        host = %config.broker.host,
        queues = ?config.worker.queues,
        replicas = config.worker.replicas,
        "Starting convert worker service"
    );

    let connection = ConnectionManager::connect(config.broker.uri(), config.worker.backoff)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(Arc::clone(&connection).supervise(cancel.clone()));

    let client = http_client().context("Failed to build HTTP client")?;
    let broker = Arc::new(AmqpBroker::new(
        Arc::clone(&connection),
        config.broker.message_ttl,
    ));
    let handler = Arc::new(TaskDispatcher::new(
        Arc::new(config.convert.clone()),
        Arc::new(ProcessRunner::new()),
        client,
    ));

    let pool = WorkerPool::start(
        broker,
        handler,
        PoolOptions {
            queues: config.worker.queues.clone(),
            replicas: config.worker.replicas,
            backoff: config.worker.backoff,
        },
        cancel.clone(),
    );

    let signal = wait_for_signal()
        .await
        .context("Failed to install signal handlers")?;
    info!(signal = %signal, "Received shutdown signal, waiting for workers");

    match pool.shutdown(config.worker.shutdown_timeout).await {
        ShutdownOutcome::Graceful => info!("Graceful shutdown"),
        ShutdownOutcome::TimedOut => warn!(
            "Shutdown timed out after {:?}, in-flight tasks were abandoned",
            config.worker.shutdown_timeout
        ),
    }

    if let Err(e) = supervisor.await {
        warn!(error = %e, "Connection supervisor failed");
    }
    connection.close().await;
    telemetry::shutdown_telemetry();

    info!("Worker service shutdown complete");
    Ok(())
}
