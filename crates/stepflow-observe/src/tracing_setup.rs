//! Tracing subscriber initialization.
//!
//! ```no_run
//! use stepflow_types::config::LoggingConfig;
//!
//! stepflow_observe::init_tracing(&LoggingConfig::default()).unwrap();
//! // ... run flows ...
//! stepflow_observe::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use stepflow_types::config::LoggingConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Kept so [`shutdown_tracing`] can flush buffered spans.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("global tracing subscriber already set: {0}")]
    AlreadyInitialized(String),
}

/// `RUST_LOG` if set and valid, otherwise [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: an fmt layer with targets and span close
/// timing, plus an OpenTelemetry stdout exporter when `config.otel` is set.
///
/// Returns an error instead of panicking if a subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TracingError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let otel_layer = config.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepflow");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TracingError::AlreadyInitialized(e.to_string()))
}

/// Flush and shut down the OpenTelemetry provider. No-op without OTel.
pub fn shutdown_tracing() {
    let Some(provider) = TRACER_PROVIDER.get() else {
        return;
    };
    if let Err(e) = provider.shutdown() {
        tracing::warn!(error = %e, "tracer provider shutdown failed");
    }
}
