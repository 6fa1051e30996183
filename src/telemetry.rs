//! Telemetry and structured logging for the slicer worker.

use std::time::Duration;

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::pipeline::{Disposition, PollOutcome};

const TRACER_NAME: &str = "slicer-worker";

/// Jobs slower than this are flagged; they are getting close to the
/// default visibility timeout.
const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(60);

/// Records telemetry for one processed message.
///
/// Emits a structured log line and an OpenTelemetry span carrying job id,
/// final status, stage reached, duration and delivery count.
pub fn record_job_telemetry(outcome: &PollOutcome, receive_count: u32, elapsed: Duration) {
    let (status, disposition) = match outcome {
        PollOutcome::Idle => return,
        PollOutcome::Completed { .. } => ("done", None),
        PollOutcome::Unacknowledged { .. } => ("unacknowledged", None),
        PollOutcome::Failed { disposition, .. } => ("failed", Some(*disposition)),
    };
    let job_id = outcome.job_id();
    let stage = outcome.stage().map(|s| s.to_string()).unwrap_or_default();
    let duration_ms = elapsed.as_millis() as i64;

    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("slicing_job");

    if let Some(id) = job_id {
        span.set_attribute(KeyValue::new("job_id", id));
    }
    span.set_attribute(KeyValue::new("status", status));
    span.set_attribute(KeyValue::new("stage", stage.clone()));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));
    span.set_attribute(KeyValue::new("receive_count", receive_count as i64));

    info!(
        job_id = ?job_id,
        status,
        stage = %stage,
        duration_ms,
        receive_count,
        "Slicing job finished"
    );

    if elapsed > SLOW_JOB_THRESHOLD {
        warn!(
            job_id = ?job_id,
            duration_ms,
            "Slicing job exceeded {:?}",
            SLOW_JOB_THRESHOLD
        );
    }

    if let PollOutcome::Failed { error, .. } = outcome {
        span.set_attribute(KeyValue::new("error", error.clone()));
    }
    if let Some(disposition) = disposition {
        let disposition = match disposition {
            Disposition::Released => "released",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Discarded => "discarded",
        };
        span.set_attribute(KeyValue::new("disposition", disposition));
    }

    span.end();
}

/// Records a worker heartbeat for monitoring worker health.
pub fn record_worker_heartbeat(processed: u64) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("processed", processed as i64));
    span.end();

    info!(processed, "Worker heartbeat");
}

/// Installs the global `tracing` subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). `LOG_FORMAT=json` switches
/// to JSON lines for log shippers.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Initializes OpenTelemetry with OTLP exporter.
///
/// This should be called once at worker startup, inside the Tokio runtime.
/// Reads configuration from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: slicer-worker)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRecord;
    use crate::pipeline::Stage;

    // Without an installed provider the global tracer is a no-op, so these
    // only check that recording never panics.

    #[test]
    fn test_record_completed_job() {
        let mut job = JobRecord::new(1, "acme", "part.stl");
        job.start_processing().unwrap();
        job.mark_done().unwrap();

        record_job_telemetry(&PollOutcome::Completed { job }, 1, Duration::from_millis(1500));
    }

    #[test]
    fn test_record_failed_job() {
        let outcome = PollOutcome::Failed {
            job: None,
            stage: Stage::MessageReceived,
            error: "Failed to decode job".to_string(),
            disposition: Disposition::DeadLettered,
        };

        record_job_telemetry(&outcome, 3, Duration::from_secs(120));
    }

    #[test]
    fn test_idle_and_heartbeat() {
        record_job_telemetry(&PollOutcome::Idle, 0, Duration::ZERO);
        record_worker_heartbeat(10);
    }
}
