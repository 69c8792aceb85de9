/*!
Observability for the Folio engine.

- Structured logging through `tracing`, rendered as JSON or plain text
- Prometheus metrics (feature `metrics`) labelled by backend and operation

Metrics are process-wide and write-only: nothing in the engine reads them back
to make a decision.
*/

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{FolioError, Result};

/// Default filter directive when `RUST_LOG` is not set
pub const DEFAULT_LOG_DIRECTIVE: &str = "folio=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<FolioMetrics>> = OnceLock::new();

/// Prometheus metrics for storage, crawling and snapshot sizes
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct FolioMetrics {
    pub storage_requests_total: CounterVec,
    pub storage_errors_total: CounterVec,
    pub storage_retries_total: CounterVec,
    pub storage_latency_seconds: HistogramVec,
    pub crawler_requests_total: IntCounter,
    pub partial_replications_total: IntCounter,
    pub snapshot_size_bytes: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, err: prometheus::Error) -> FolioError {
    FolioError::validation(format!("Failed to create metric {name}: {err}"))
}

#[cfg(feature = "metrics")]
impl FolioMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let labels = &["backend", "operation"];

        let storage_requests_total = CounterVec::new(
            Opts::new("folio_storage_requests_total", "Storage backend calls made by Folio"),
            labels,
        )
        .map_err(|e| metric_error("folio_storage_requests_total", e))?;

        let storage_errors_total = CounterVec::new(
            Opts::new("folio_storage_errors_total", "Storage backend calls that failed"),
            labels,
        )
        .map_err(|e| metric_error("folio_storage_errors_total", e))?;

        let storage_retries_total = CounterVec::new(
            Opts::new("folio_storage_retries_total", "Storage backend calls retried after a transient failure"),
            labels,
        )
        .map_err(|e| metric_error("folio_storage_retries_total", e))?;

        let storage_latency_seconds = HistogramVec::new(
            HistogramOpts::new("folio_storage_latency_seconds", "Duration of storage backend calls in seconds"),
            labels,
        )
        .map_err(|e| metric_error("folio_storage_latency_seconds", e))?;

        let crawler_requests_total =
            IntCounter::new("folio_crawler_requests_total", "Workspace API requests admitted by the rate limiter")
                .map_err(|e| metric_error("folio_crawler_requests_total", e))?;

        let partial_replications_total = IntCounter::new(
            "folio_partial_replications_total",
            "Replicated writes that succeeded on some but not all backends",
        )
        .map_err(|e| metric_error("folio_partial_replications_total", e))?;

        let snapshot_size_bytes = Histogram::with_opts(
            HistogramOpts::new("folio_snapshot_size_bytes", "Compressed size of snapshot data artifacts")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).unwrap_or_default()),
        )
        .map_err(|e| metric_error("folio_snapshot_size_bytes", e))?;

        registry
            .register(Box::new(storage_requests_total.clone()))
            .map_err(|e| metric_error("folio_storage_requests_total", e))?;
        registry
            .register(Box::new(storage_errors_total.clone()))
            .map_err(|e| metric_error("folio_storage_errors_total", e))?;
        registry
            .register(Box::new(storage_retries_total.clone()))
            .map_err(|e| metric_error("folio_storage_retries_total", e))?;
        registry
            .register(Box::new(storage_latency_seconds.clone()))
            .map_err(|e| metric_error("folio_storage_latency_seconds", e))?;
        registry
            .register(Box::new(crawler_requests_total.clone()))
            .map_err(|e| metric_error("folio_crawler_requests_total", e))?;
        registry
            .register(Box::new(partial_replications_total.clone()))
            .map_err(|e| metric_error("folio_partial_replications_total", e))?;
        registry
            .register(Box::new(snapshot_size_bytes.clone()))
            .map_err(|e| metric_error("folio_snapshot_size_bytes", e))?;

        Ok(Self {
            storage_requests_total,
            storage_errors_total,
            storage_retries_total,
            storage_latency_seconds,
            crawler_requests_total,
            partial_replications_total,
            snapshot_size_bytes,
            registry,
        })
    }

    /// The process-wide metrics instance, or `None` if registration failed
    pub fn global() -> Option<&'static FolioMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_storage_retry(&self, backend: &str, operation: &str) {
        self.storage_retries_total.with_label_values(&[backend, operation]).inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| FolioError::validation(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| FolioError::validation(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Times one storage call and records its outcome
#[cfg(feature = "metrics")]
pub struct StorageTimer {
    start: Instant,
    backend: String,
    operation: &'static str,
}

#[cfg(feature = "metrics")]
impl StorageTimer {
    pub fn start(backend: &str, operation: &'static str) -> Self {
        if let Some(metrics) = FolioMetrics::global() {
            metrics
                .storage_requests_total
                .with_label_values(&[backend, operation])
                .inc();
        }
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            operation,
        }
    }

    pub fn finish(self, ok: bool) {
        if let Some(metrics) = FolioMetrics::global() {
            let labels = [self.backend.as_str(), self.operation];
            metrics
                .storage_latency_seconds
                .with_label_values(&labels)
                .observe(self.start.elapsed().as_secs_f64());
            if !ok {
                metrics.storage_errors_total.with_label_values(&labels).inc();
            }
        }
    }
}

/// Record one admitted workspace API request
#[cfg(feature = "metrics")]
pub(crate) fn record_crawler_request() {
    if let Some(metrics) = FolioMetrics::global() {
        metrics.crawler_requests_total.inc();
    }
}

/// Record a write that reached only some backends
#[cfg(feature = "metrics")]
pub(crate) fn record_partial_replication() {
    if let Some(metrics) = FolioMetrics::global() {
        metrics.partial_replications_total.inc();
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_snapshot_size(size_bytes: usize) {
    if let Some(metrics) = FolioMetrics::global() {
        metrics.snapshot_size_bytes.observe(size_bytes as f64);
    }
}

#[cfg(feature = "metrics")]
pub(crate) fn record_storage_retry(backend: &str, operation: &str) {
    if let Some(metrics) = FolioMetrics::global() {
        metrics.record_storage_retry(backend, operation);
    }
}

/// No-op stand-in when metrics are compiled out
#[cfg(not(feature = "metrics"))]
pub(crate) struct StorageTimer;

#[cfg(not(feature = "metrics"))]
impl StorageTimer {
    pub(crate) fn start(_backend: &str, _operation: &'static str) -> Self {
        Self
    }

    pub(crate) fn finish(self, _ok: bool) {}
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_storage_retry(_backend: &str, _operation: &str) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_crawler_request() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_partial_replication() {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_snapshot_size(_size_bytes: usize) {}

/// Install the global tracing subscriber with the default `folio=info` filter
///
/// `RUST_LOG` overrides the filter. With `json` set, each event is written as
/// one JSON object per line; otherwise a human-readable format is used.
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with(DEFAULT_LOG_DIRECTIVE, json)
}

/// Same as [`init_observability`] with a caller-chosen default filter
pub fn init_observability_with(default_directive: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| FolioError::validation(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        set_global_default(subscriber)
    };

    result.map_err(|e| FolioError::validation(format!("Failed to set global tracing subscriber: {e}")))?;

    #[cfg(feature = "metrics")]
    FolioMetrics::global();

    tracing::debug!("Folio observability initialized");
    Ok(())
}
