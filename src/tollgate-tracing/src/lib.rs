use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{Resource, trace as sdktrace};
use std::borrow::Cow;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{Registry, prelude::*};

/// Output shape of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Plain,
        }
    }
}

/// Builds the level filter; `RUST_LOG` wins over the configured mode.
pub fn build_filter(logging_mode: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging_mode))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn provider(service_name: &str, endpoint: &str) -> Result<sdktrace::SdkTracerProvider> {
    let resource = Resource::builder()
        .with_service_name(Cow::Owned(service_name.to_string()))
        .with_attributes(vec![KeyValue::new("service.version", env!("CARGO_PKG_VERSION"))])
        .build();

    if endpoint == "stdout" {
        return Ok(sdktrace::SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .with_resource(resource)
            .build());
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .with_context(|| format!("build otlp exporter for {endpoint}"))?;
    Ok(sdktrace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

/// Installs the global subscriber.
///
/// Logs go to stderr so command output on stdout stays machine readable.
/// When `otlp_endpoint` is set, spans are also exported: `stdout` selects the
/// stdout exporter, anything else is treated as an OTLP/HTTP endpoint.
pub fn init(service_name: &str, otlp_endpoint: Option<&str>, logging_mode: &str, format: LogFormat) -> Result<()> {
    let filter = build_filter(logging_mode);

    // boxed so the three modes unify
    let fmt_layer: Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_filter(filter),
        ),
        LogFormat::Pretty => Box::new(fmt::layer().pretty().with_writer(std::io::stderr).with_filter(filter)),
        LogFormat::Plain => Box::new(fmt::layer().with_writer(std::io::stderr).with_filter(filter)),
    };

    let otel_layer = match otlp_endpoint.filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => {
            let tracer_provider = provider(service_name, endpoint)?;
            let tracer = tracer_provider.tracer(Cow::Owned(service_name.to_string()));
            global::set_tracer_provider(tracer_provider);
            Some(OpenTelemetryLayer::new(tracer))
        }
        None => None,
    };

    let subscriber = Registry::default().with(fmt_layer).with(otel_layer);
    tracing::subscriber::set_global_default(subscriber).context("install tracing subscriber")?;
    Ok(())
}
