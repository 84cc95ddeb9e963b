use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use hitl_protocol::ReviewOutcome;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

const SERVICE_NAME: &str = "hitlgate";

/// Keeps the telemetry providers alive for the lifetime of the process.
pub struct Telemetry {
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Flush and stop the OTLP exporter, if any.
    pub fn shutdown(self) {
        if let Some(provider) = self.meter_provider {
            if let Err(err) = provider.shutdown() {
                warn!("metrics provider did not shut down cleanly: {}", err);
            }
        }
    }
}

/// Install the global subscriber:
///   - stdout, filtered by `log_level`
///   - `<root>/<log_file>`, daily rolling plain text
///   - `<root>/<event_file>`, daily rolling JSON with one line per finished
///     review (target `review`)
///
/// With `otel_endpoint` set, metrics are also exported over OTLP/HTTP.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<String>,
) -> Result<Telemetry> {
    let env_filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level `{}`", log_level))?;

    let txt_layer = tracing_fmt::layer()
        .with_writer(rolling_appender(&root.join(log_file))?)
        .with_ansi(false);

    let json_layer = tracing_fmt::layer()
        .json()
        .with_writer(rolling_appender(&root.join(event_file))?)
        .with_target(true)
        .with_filter(EnvFilter::new("review=info"));

    let stdout_layer = tracing_fmt::layer().with_thread_names(true);

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    let meter_provider = match otel_endpoint {
        Some(endpoint) => {
            let provider = init_metrics(&endpoint)?;
            global::set_meter_provider(provider.clone());
            info!("exporting metrics to {}", endpoint);
            Some(provider)
        }
        None => None,
    };

    Ok(Telemetry { meter_provider })
}

fn rolling_appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("log path `{}` has no parent directory", path.display()))?;
    let prefix = path
        .file_name()
        .ok_or_else(|| anyhow!("log path `{}` has no file name", path.display()))?
        .to_string_lossy()
        .into_owned();
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .build(dir)
        .with_context(|| format!("could not open log file in {}", dir.display()))
}

fn init_metrics(endpoint: &str) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("could not build the OTLP metric exporter")?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build())
}

/// Counters and histograms recorded by the broker. Backed by whatever meter
/// provider is installed globally (the no-op one unless OTLP is enabled).
#[derive(Clone)]
pub struct ReviewMetrics {
    reviews_started: Counter<u64>,
    reviews_finished: Counter<u64>,
    deliveries: Counter<u64>,
    review_wait_ms: Histogram<f64>,
}

impl ReviewMetrics {
    pub fn new() -> Self {
        let meter = global::meter(SERVICE_NAME);
        Self {
            reviews_started: meter
                .u64_counter("hitl_reviews_started")
                .with_description("Review requests broadcast to reviewers")
                .build(),
            reviews_finished: meter
                .u64_counter("hitl_reviews_finished")
                .with_description("Reviews that reached a terminal outcome")
                .build(),
            deliveries: meter
                .u64_counter("hitl_deliveries")
                .with_description("Inbound decisions, by correlation status")
                .build(),
            review_wait_ms: meter
                .f64_histogram("hitl_review_wait_ms")
                .with_description("Time a caller spent suspended on a review")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn review_started(&self) {
        self.reviews_started.add(1, &[]);
    }

    pub fn review_finished(&self, outcome: &ReviewOutcome, waited: Duration) {
        let attrs = [KeyValue::new("outcome", outcome.as_ref().to_string())];
        self.reviews_finished.add(1, &attrs);
        self.review_wait_ms.record(waited.as_secs_f64() * 1_000.0, &attrs);
    }

    pub fn delivery(&self, status: &'static str) {
        self.deliveries.add(1, &[KeyValue::new("status", status)]);
    }
}

impl Default for ReviewMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReviewMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReviewMetrics")
    }
}
