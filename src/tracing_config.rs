use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Settings;

const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

fn default_directives(debug: bool) -> &'static str {
    if debug {
        "info,bookshelf=debug,sqlx=debug"
    } else {
        "info"
    }
}

/// Installs the global subscriber. Spans are also exported over OTLP when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing(settings: &Settings) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(settings.debug)));

    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();
    let fmt_layer = tracing_subscriber::fmt::layer().event_format(format).with_filter(env_filter);

    let otel_layer = if std::env::var_os(OTLP_ENDPOINT_VAR).is_some() {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

        // Assumes a GRPC endpoint (e.g port 4317)
        let exporter = opentelemetry_otlp::new_exporter().tonic();
        let tracer_provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(opentelemetry_sdk::Resource::default()),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("Failed to create tracer provider")?;
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());

        let tracing_level_filter = tracing_subscriber::filter::Targets::new()
            .with_target("bookshelf", tracing::Level::TRACE)
            .with_target("sqlx", tracing::Level::DEBUG)
            .with_target("tower_http", tracing::Level::INFO)
            .with_target("reqwest_tracing", tracing::Level::INFO)
            .with_target("h2", tracing::Level::WARN)
            .with_default(tracing::Level::INFO);

        Some(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer("bookshelf"))
                .with_filter(tracing_level_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("Failed to set subscriber")
}
