//! Logging and OpenTelemetry setup.
//!
//! Every process logs to stderr through a tracing-subscriber registry, so
//! stdout stays free for `batchq results`. With an OTLP endpoint the same
//! subscriber also exports spans and log records, and the global meter
//! provider is pointed at the collector. All three signals share one
//! [`Resource`] identifying the binary and the process whose pid is folded
//! into every worker id.

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
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Instrumentation scope for spans emitted by this crate.
const SCOPE: &str = env!("CARGO_PKG_NAME");

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` keeps
    /// everything local.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset, e.g. `"info"` or
    /// `"batchq=debug"`.
    pub log_level: String,
}

impl From<&Config> for TelemetryConfig {
    fn from(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: SCOPE.to_string(),
            log_level: config.log_level.clone(),
        }
    }
}

/// The resource attached to every exported signal.
pub fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("process.pid", i64::from(std::process::id())),
        ])
        .build()
}

/// Exporting providers, present only when an endpoint is configured.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Exporters {
    fn connect(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_failed("span"))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_failed("metric"))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_failed("log"))?;

        let exporters = Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        };
        opentelemetry::global::set_meter_provider(exporters.meter.clone());
        Ok(exporters)
    }
}

fn exporter_failed(
    signal: &'static str,
) -> impl Fn(opentelemetry_otlp::ExporterBuildError) -> Error {
    move |e| Error::Other(format!("OTLP {signal} exporter: {e}"))
}

/// Flushes and shuts down the exporters when dropped. Hold it until the
/// process is about to exit.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.tracer.force_flush();
            let _ = exporters.meter.force_flush();
            let _ = exporters.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logger.shutdown();
            let _ = exporters.meter.shutdown();
            let _ = exporters.tracer.shutdown();
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::connect(endpoint, resource(&config.service_name)))
        .transpose()?;

    let span_layer = exporters.as_ref().map(|exporters| {
        tracing_opentelemetry::layer().with_tracer(exporters.tracer.tracer(SCOPE))
    });
    let log_layer = exporters
        .as_ref()
        .map(|exporters| OpenTelemetryTracingBridge::new(&exporters.logger));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(span_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { exporters })
}
