use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const SERVICE_NAME: &str = "extgraph";
const LOG_FILE: &str = "extgraph.log";
const PATH_EVENTS_FILE: &str = "extgraph-paths.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `extgraph=debug`.
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), log_dir: None, otel_endpoint: None }
    }
}

impl LogConfig {
    pub fn new(log_level: &str, log_dir: Option<PathBuf>, otel_endpoint: Option<String>) -> Self {
        Self { log_level: log_level.to_string(), log_dir, otel_endpoint }
    }
}

/// Providers that must stay alive for exporting to continue.
pub struct TelemetryGuard {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(p) = self.logger_provider.take() {
            let _ = p.shutdown();
        }
        if let Some(p) = self.meter_provider.take() {
            let _ = p.shutdown();
        }
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_logs(endpoint: &str) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: stdout always, rolling files when a log
/// directory is given (plain text plus a JSON file of `target = "path"`
/// events), OTLP logs and metrics when an endpoint is given.
pub fn init_tracing(config: &LogConfig) -> Result<TelemetryGuard> {
    let mut guard = TelemetryGuard {
        logger_provider: None,
        meter_provider: None,
        _file_guards: Vec::new(),
    };

    let fmt_layer = fmt::layer().with_thread_names(true).with_filter(filter(&config.log_level));

    let file_layers = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
            let (txt, txt_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(
                    Rotation::DAILY,
                    dir,
                    LOG_FILE,
                ));
            let (json, json_guard) =
                tracing_appender::non_blocking(RollingFileAppender::new(
                    Rotation::DAILY,
                    dir,
                    PATH_EVENTS_FILE,
                ));
            guard._file_guards.push(txt_guard);
            guard._file_guards.push(json_guard);
            let txt_layer = fmt::layer()
                .with_writer(txt)
                .with_ansi(false)
                .with_filter(filter(&config.log_level));
            let json_layer = fmt::layer()
                .json()
                .with_writer(json)
                .with_target(true)
                .with_filter(EnvFilter::new("path=debug"));
            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    let otel_layer = match &config.otel_endpoint {
        Some(endpoint) => {
            let logger_provider = init_logs(endpoint)?;
            let meter_provider = init_metrics(endpoint)?;
            global::set_meter_provider(meter_provider.clone());
            let layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(
                filter(&config.log_level)
                    .add_directive("hyper=off".parse()?)
                    .add_directive("tonic=off".parse()?)
                    .add_directive("h2=off".parse()?)
                    .add_directive("reqwest=off".parse()?),
            );
            guard.logger_provider = Some(logger_provider);
            guard.meter_provider = Some(meter_provider);
            Some(layer)
        }
        None => None,
    };

    Registry::default()
        .with(fmt_layer)
        .with(file_layers)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(guard)
}

/// Counters describing path bookkeeping. Recorded against the global meter,
/// which is a no-op until an OTLP endpoint is configured.
pub struct PathMetrics {
    pub paths_created: Counter<u64>,
    pub paths_timed_out: Counter<u64>,
    pub results_dropped: Counter<u64>,
    pub paths_flushed: Counter<u64>,
}

impl PathMetrics {
    fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            paths_created: meter
                .u64_counter("paths_created")
                .with_description("IN and OUT paths registered")
                .build(),
            paths_timed_out: meter
                .u64_counter("paths_timed_out")
                .with_description("OUT paths answered by a synthesized timeout result")
                .build(),
            results_dropped: meter
                .u64_counter("results_dropped")
                .with_description("Results whose path was already gone")
                .build(),
            paths_flushed: meter
                .u64_counter("paths_flushed")
                .with_description("Paths force-closed at extension shutdown")
                .build(),
        }
    }
}

pub static PATH_METRICS: Lazy<PathMetrics> = Lazy::new(PathMetrics::new);
