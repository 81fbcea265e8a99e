//! Trace pipeline for the external processor.
//!
//! Spans are exported over OTLP/gRPC to the collector named by
//! `otlp.endpoint`. The processor sits behind Envoy, which already emits
//! request metrics for the whole filter chain, so this sidecar exports
//! traces only; logs go to stdout as JSON through the tracing subscriber.
//! W3C trace context is registered as the global propagator so filter spans
//! join the traces Envoy starts rather than opening new roots.

use anyhow::{Context as _, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Instrumentation scope for all spans emitted by this service.
pub const TRACER_NAME: &str = "ext-proc";

/// Install the global trace provider, propagator, and tracing subscriber.
///
/// The tracer provider is process-global: installed once here, flushed and
/// torn down by [`shutdown`] on exit.
///
/// # Errors
///
/// Returns an error if the OTLP exporter cannot be built or a subscriber is
/// already installed.
pub fn init(otlp_endpoint: &str, log_level: &str) -> Result<()> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(otlp_endpoint)
        .build_span_exporter()
        .context("failed to build OTLP span exporter")?;

    let provider = trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace::Config::default().with_resource(service_resource()))
        .build();
    let tracer = provider.tracer(TRACER_NAME);

    global::set_tracer_provider(provider);
    global::set_text_map_propagator(TraceContextPropagator::new());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(())
}

/// Flush and shut down the global tracer provider.
pub fn shutdown() {
    global::shutdown_tracer_provider();
}

/// SDK default resource merged with this service's identity; the identity
/// attributes win on conflict.
fn service_resource() -> Resource {
    Resource::default().merge(&Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            "ext-proc",
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ]))
}
