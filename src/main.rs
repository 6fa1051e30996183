//! Slicer Worker Service
//!
//! Consumes slicing jobs from a Redis Streams queue, slices the referenced
//! model with an external converter and publishes the resulting G-code.
//!
//! ## Architecture
//!
//! - **Input queue**: Redis stream (`SLICER_INPUT_QUEUE`), leased through a consumer group
//! - **Output queue**: Redis stream (`SLICER_OUTPUT_QUEUE`) receiving `done` / `failed` records
//! - **Storage**: S3 bucket, `models/{id}-{filename}` in, `gcode/{id}.gcode` out
//! - **Converter**: external slicer executable, run with a watchdog
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables (a `.env` file is loaded if present):
//! - `SLICER_BUCKET`, `SLICER_INPUT_QUEUE`, `SLICER_OUTPUT_QUEUE`, `AWS_REGION`: required
//! - `REDIS_URL`: Redis connection string (default: redis://127.0.0.1/)
//! - `SLICER_CONVERTERS`: `name=path` list (default: slic3r=slic3r/slic3r)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `config::WorkerConfig` for the full list.

use std::sync::Arc;

use anyhow::{Context, Result};
use redis::Client;
use tokio::signal;
use tracing::{info, warn};

use slicer_worker::config::WorkerConfig;
use slicer_worker::converter::ConverterInvoker;
use slicer_worker::pipeline::Pipeline;
use slicer_worker::queue::RedisStreamQueue;
use slicer_worker::store::S3ObjectStore;
use slicer_worker::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting slicer worker service");

    let config = WorkerConfig::from_env().context("Invalid configuration")?;

    info!(
        "Configuration: redis_url={}, input={}, output={}, bucket={}, consumer={}",
        config.redis_url,
        config.input_queue,
        config.output_queue,
        config.s3.bucket,
        config.consumer_name
    );

    // Connect to Redis
    let client = Client::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    let queue = RedisStreamQueue::new(
        conn,
        config.consumer_group.clone(),
        config.consumer_name.clone(),
        config.receive_wait,
    );
    queue
        .ensure_group(&config.input_queue)
        .await
        .context("Failed to prepare input queue")?;

    info!("Connected to Redis");

    let store = S3ObjectStore::new(config.s3.clone())
        .await
        .context("Failed to create object store client")?;
    store
        .check_connectivity()
        .await
        .context("Object store unreachable")?;

    let registry = config.converter_registry();
    for name in registry.names() {
        let path = registry.resolve(name)?;
        if !path.exists() {
            warn!("Converter {} not found at {}", name, path.display());
        }
    }

    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .with_context(|| format!("Failed to create scratch dir {}", config.scratch_dir.display()))?;

    let pipeline = Pipeline::new(
        Arc::new(queue),
        Arc::new(store),
        ConverterInvoker::new(registry, config.converter_timeout),
        config.pipeline_settings(),
    );

    info!("Worker service ready, press Ctrl+C to shutdown");

    pipeline
        .run(async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, finishing current job...");
        })
        .await;

    opentelemetry::global::shutdown_tracer_provider();
    info!("Worker service shutdown complete");
    Ok(())
}
