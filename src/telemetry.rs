//! Telemetry and structured logging for the convert worker.

use crate::config::Environment;
use crate::error::TaskError;
use crate::task::ConvertTask;
use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::{global, KeyValue};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "convert-worker";

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` overrides the filter. Local runs log human-readable lines,
/// deployed environments log JSON.
pub fn init_logging(env: Environment) {
    let default_filter = match env {
        Environment::Dev => "debug",
        Environment::Local | Environment::Prod => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);

    match env {
        Environment::Local => registry.with(fmt::layer()).init(),
        Environment::Dev | Environment::Prod => registry
            .with(fmt::layer().json().with_current_span(true))
            .init(),
    }
}

/// Records one finished task as an OpenTelemetry span.
pub fn record_task_telemetry(
    task: &ConvertTask,
    result: &Result<(), TaskError>,
    duration: Duration,
) {
    let tracer = global::tracer(SERVICE_NAME);
    let mut span = tracer.start("convert_task");

    let (attributes, status) = task_span_fields(task, result, duration);
    span.set_attributes(attributes);
    span.set_status(status);
    span.end();
}

/// Attributes and status describing one finished task.
fn task_span_fields(
    task: &ConvertTask,
    result: &Result<(), TaskError>,
    duration: Duration,
) -> (Vec<KeyValue>, Status) {
    let mut attributes = vec![
        KeyValue::new("request_id", task.request_id.clone()),
        KeyValue::new("task_id", task.id.clone()),
        KeyValue::new("command", task.command.to_string()),
        KeyValue::new("queue", task.queue.clone()),
        KeyValue::new("formats", task.formats.join(",")),
        KeyValue::new("duration_ms", duration.as_millis() as i64),
    ];

    let status = match result {
        Ok(()) => {
            attributes.push(KeyValue::new("outcome", "success"));
            Status::Ok
        }
        Err(e) => {
            attributes.push(KeyValue::new("outcome", "failure"));
            attributes.push(KeyValue::new("stage", e.stage().to_string()));
            Status::error(e.to_string())
        }
    };
    (attributes, status)
}

/// Initializes OpenTelemetry with the OTLP exporter.
///
/// Reads `OTEL_EXPORTER_OTLP_ENDPOINT` (default `http://localhost:4317`) and
/// `OTEL_SERVICE_NAME` (default `convert-worker`). Must run inside the Tokio
/// runtime.
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string());

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

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

/// Flushes pending spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}
