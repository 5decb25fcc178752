//! Logging and distributed tracing setup
//!
//! Console logs always go through `tracing-subscriber`. When an OTLP
//! endpoint is configured, spans are also exported so a job's lifecycle
//! (claim, acquire, run, release) shows up as one trace keyed by run id.
//!
//! ```text
//! runvisor ─┬─► stderr (text or JSON)
//!           └─► OTLP (gRPC) → collector → Tempo/Jaeger     [optional]
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,runvisor=debug";

/// Logging options resolved from config and CLI
#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
    /// OTLP collector endpoint, e.g. `http://localhost:4317`
    pub otlp_endpoint: Option<String>,
}

/// Initialize the global subscriber
///
/// # Example
/// ```ignore
/// init_tracing("runvisor", &TracingOptions::default())?;
/// ```
pub fn init_tracing(
    service_name: &str,
    options: &TracingOptions,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    let otel_layer = match options.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)?;

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    tracing::info!(
        service = service_name,
        otlp = options.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "tracing initialized"
    );

    Ok(())
}

/// Flush pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
