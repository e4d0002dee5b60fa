//! Sets up tracing and metrics globally.

use std::error::Error;

use opentelemetry::propagation::composite::TextMapCompositePropagator;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions as semcov;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LEVEL: tracing::level_filters::LevelFilter =
    tracing::level_filters::LevelFilter::INFO;

/// Keeps the global providers alive. Both are flushed and unregistered on
/// drop.
pub struct GlobalTracing {
    meter_provider: SdkMeterProvider,
}

/// Initialize a generic setup that exports traces and metrics over OTLP, and
/// install it as the global tracer and meter provider. Gateway middleware
/// built without explicit providers reports through these.
///
/// Logs go to stdout as JSON, filtered by `RUST_LOG` (default `info`).
///
/// All other configuration is done by standard environment variables:
///
///   * https://opentelemetry.io/docs/specs/otel/configuration/sdk-environment-variables/
///   * https://opentelemetry.io/docs/languages/sdk-configuration/otlp-exporter/
pub fn init_tracing(
    endpoint: Option<&str>,
    service_name: &'static str,
    service_version: &'static str,
) -> Result<GlobalTracing, Box<dyn Error + Send + Sync>> {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(opentelemetry_zipkin::Propagator::new()),
    ]));

    let resource = Resource::new(vec![
        KeyValue::new(semcov::resource::SERVICE_NAME, service_name),
        KeyValue::new(semcov::resource::SERVICE_VERSION, service_version),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter(endpoint))
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource.clone()))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(opentelemetry_sdk::runtime::Tokio)
        .with_exporter(otlp_exporter(endpoint))
        .with_resource(resource)
        .build()?;
    global::set_meter_provider(meter_provider.clone());

    tracing_subscriber::registry()
        .with(
            tracing_opentelemetry::layer()
                .with_error_records_to_exceptions(true)
                .with_tracer(tracer),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(DEFAULT_LEVEL.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(tracing_subscriber::fmt::time::time()),
        )
        .init();

    tracing::info!(service_name, service_version, "telemetry initialized");
    Ok(GlobalTracing { meter_provider })
}

fn otlp_exporter(endpoint: Option<&str>) -> opentelemetry_otlp::TonicExporterBuilder {
    let exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Some(endpoint) = endpoint {
        exporter.with_endpoint(endpoint)
    } else {
        exporter
    }
}

impl Drop for GlobalTracing {
    fn drop(&mut self) {
        if let Err(error) = self.meter_provider.shutdown() {
            tracing::warn!(%error, "failed to shut down the meter provider");
        }
        global::shutdown_tracer_provider();
    }
}
