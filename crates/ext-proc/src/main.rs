//! `ext-proc` — policy-enforcing external processor binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Settings`] from the config file and environment.
//! 2. Initialise the telemetry pipeline (OTLP + tracing).
//! 3. Build the policy filter factory (compiling or downloading policies).
//! 4. Serve `ExternalProcessor/Process` until SIGINT.

mod config;
mod error;
mod filter;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::{global, Context};
use tracing::info;

use config::Settings;
use filter::opa::OpaFilterFactory;
use filter::server::ExtProcService;
use filter::HttpFilterFactory;
use telemetry::TRACER_NAME;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let settings = Settings::load().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        anyhow::Error::from(e)
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&settings.otlp.endpoint, &settings.log_level)?;
    // The Debug impl redacts the bundle-service token.
    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %settings.host,
        port = settings.port,
        filter = %settings.filter,
        policy_engine = ?settings.local.policy_engine,
        "ext-proc starting"
    );

    let tracer = global::tracer(TRACER_NAME);
    let span = tracer.start("main");
    let cx = Context::current_with_span(span);

    // -----------------------------------------------------------------------
    // 3. Filter factory
    // -----------------------------------------------------------------------
    // "opa" is the only filter implementation and also the default selector.
    let factory: Arc<dyn HttpFilterFactory> = {
        let factory = OpaFilterFactory::new(&cx, &settings.local.policy_engine)
            .await
            .map_err(|e| {
                filter::record_span_error(&cx, &e);
                anyhow::Error::from(e)
            })?;
        Arc::new(factory)
    };

    // -----------------------------------------------------------------------
    // 4. gRPC server
    // -----------------------------------------------------------------------
    let addr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .context("invalid listen address")?;
    info!(%addr, "listening");

    let service = ExtProcService::new(factory);
    tonic::transport::Server::builder()
        .trace_fn(|_| tracing::info_span!("ext_proc_stream"))
        .add_service(ExternalProcessorServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("gRPC server failed")?;

    cx.span().end();
    telemetry::shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
