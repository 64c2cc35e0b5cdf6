//! Logging and optional trace export for kubedr runs
//!
//! Logs go to stderr through `tracing-subscriber`, either human-readable or
//! as JSON. When an OTLP endpoint is configured, spans are also exported so
//! a long backup can be followed phase by phase in a trace viewer.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when neither the config nor `RUST_LOG` sets one
pub const DEFAULT_LOG_FILTER: &str = "info,kubedr=debug,kube=info,tower=warn,hyper=warn";

/// Downward-API variables mapped to resource attributes when present
const POD_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP exporter could not be built
    #[error("otlp exporter: {0}")]
    Exporter(String),

    /// A global subscriber was already installed, or the filter is invalid
    #[error("log subscriber: {0}")]
    Subscriber(String),
}

/// How a run reports logs and traces
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name on exported spans
    pub service_name: String,
    /// OTLP collector, e.g. `http://otel-collector:4317`; logs only when `None`
    pub otlp_endpoint: Option<String>,
    /// JSON log lines instead of the human-readable format
    pub json: bool,
    /// Explicit filter directive; `RUST_LOG`, then [`DEFAULT_LOG_FILTER`], otherwise
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "kubedr".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            json: false,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.log_filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| TelemetryError::Subscriber(format!("filter {:?}: {}", directive, e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
        }
    }
}

/// Install the global subscriber. Call once, before any work starts.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = config.env_filter()?;

    let traces = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let provider = otlp_provider(endpoint, resource(&config.service_name))?;
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let logs = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(logs)
        .with(traces)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// Flush pending spans. A no-op when no exporter was installed.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(POD_ATTRIBUTES.iter().filter_map(|(var, key)| {
        std::env::var(var)
            .ok()
            .map(|value| KeyValue::new(*key, value))
    }));
    Resource::new(attributes)
}

fn otlp_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}
