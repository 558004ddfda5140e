//! Logging, traces and metrics for the relay.
//!
//! Every process logs through `tracing`. With an OTLP collector configured,
//! spans, metric instruments and log records are also shipped there under one
//! resource, next to compact stderr output. Without one, only the fmt layer is
//! installed and the instruments in [`metrics`] stay no-ops.

pub mod metrics;
pub mod task;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{Error, Result};

/// Instrumentation scope for relay spans.
const TRACER_NAME: &str = "studio-relay";

pub struct TelemetryConfig {
    /// OTLP gRPC collector, e.g. `http://localhost:4317`.
    pub endpoint: Option<String>,
    /// `service.name` on every exported signal.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn new(endpoint: Option<String>, log_level: impl Into<String>) -> Self {
        Self {
            endpoint,
            service_name: TRACER_NAME.to_string(),
            log_level: log_level.into(),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// The three OTLP export pipelines of one process.
struct Pipelines {
    traces: SdkTracerProvider,
    metrics: SdkMeterProvider,
    logs: SdkLoggerProvider,
}

impl Pipelines {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        Ok(Self {
            traces: tracer_provider(endpoint, resource.clone())?,
            metrics: meter_provider(endpoint, resource.clone())?,
            logs: logger_provider(endpoint, resource)?,
        })
    }

    fn flush(&self) {
        let _ = self.traces.force_flush();
        let _ = self.metrics.force_flush();
        let _ = self.logs.force_flush();
    }

    /// Logs first so records emitted while spans close still get out.
    fn shutdown(&self) {
        let _ = self.logs.shutdown();
        let _ = self.metrics.shutdown();
        let _ = self.traces.shutdown();
    }
}

/// Keeps export running. Dropping it flushes and stops every pipeline, so
/// hold it for as long as the process runs.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// True when signals are exported to a collector.
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }

    /// Push buffered spans, metrics and logs out now. Tests call this before
    /// querying the backends.
    pub fn force_flush(&self) {
        if let Some(pipelines) = &self.pipelines {
            pipelines.flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(pipelines) = self.pipelines.take() {
            pipelines.shutdown();
        }
    }
}

/// Install the global subscriber, and the global meter provider when an
/// endpoint is set.
///
/// # Errors
///
/// Fails when an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = config.filter();

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { pipelines: None });
    };

    let pipelines = Pipelines::build(endpoint, resource(&config))?;
    opentelemetry::global::set_meter_provider(pipelines.metrics.clone());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(pipelines.traces.tracer(TRACER_NAME)))
        .with(OpenTelemetryTracingBridge::new(&pipelines.logs))
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        pipelines: Some(pipelines),
    })
}

fn resource(config: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
        .build()
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn logger_provider(endpoint: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}
