//! Metrics collection for the storage connector
//!
//! Process-wide Prometheus collectors held in a private registry. Recording
//! is cheap and never fails; if registration failed at start-up the
//! recording helpers become no-ops.

use crate::core::{Error, ErrorKind, Result};
use crate::types::ChunkStatus;
use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Instant;

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Connector counters and latencies
pub struct Metrics {
    /// Operations issued, by operation name
    pub requests: IntCounterVec,
    /// Failed operations, by error class
    pub failures: IntCounterVec,
    /// Writes rejected for a stale revision
    pub conflicts: IntCounter,
    /// Deletes whose revision was substituted by the conflict resolver
    pub revision_refreshes: IntCounter,
    /// Bulk chunks processed, by outcome
    pub bulk_chunks: IntCounterVec,
    /// Pool connection attempts
    pub pool_init_attempts: IntCounter,
    /// Operation latency in seconds, by operation name
    pub request_duration: HistogramVec,
}

impl Metrics {
    /// Create and register every collector with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            requests: IntCounterVec::new(
                Opts::new("cmis_store_requests_total", "Store operations issued"),
                &["operation"],
            )?,
            failures: IntCounterVec::new(
                Opts::new("cmis_store_failures_total", "Store operations that failed"),
                &["kind"],
            )?,
            conflicts: IntCounter::new(
                "cmis_store_conflicts_total",
                "Writes rejected because of a stale revision",
            )?,
            revision_refreshes: IntCounter::new(
                "cmis_store_revision_refreshes_total",
                "Deletes that proceeded with a refreshed revision",
            )?,
            bulk_chunks: IntCounterVec::new(
                Opts::new("cmis_store_bulk_chunks_total", "Bulk delete chunks by outcome"),
                &["status"],
            )?,
            pool_init_attempts: IntCounter::new(
                "cmis_store_pool_init_attempts_total",
                "Connection attempts made while initializing the pool",
            )?,
            request_duration: HistogramVec::new(
                HistogramOpts::new(
                    "cmis_store_request_duration_seconds",
                    "Duration of store operations in seconds",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
                &["operation"],
            )?,
        };

        registry.register(Box::new(metrics.requests.clone()))?;
        registry.register(Box::new(metrics.failures.clone()))?;
        registry.register(Box::new(metrics.conflicts.clone()))?;
        registry.register(Box::new(metrics.revision_refreshes.clone()))?;
        registry.register(Box::new(metrics.bulk_chunks.clone()))?;
        registry.register(Box::new(metrics.pool_init_attempts.clone()))?;
        registry.register(Box::new(metrics.request_duration.clone()))?;
        Ok(metrics)
    }

    /// Get the global metrics instance, if registration succeeded
    pub fn global() -> Option<&'static Metrics> {
        static INSTANCE: Lazy<Option<Metrics>> = Lazy::new(|| Metrics::new(&REGISTRY).ok());
        INSTANCE.as_ref()
    }
}

/// Timer for one operation; records into the latency histogram when finished
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing `operation`
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Record elapsed time and the outcome of `result`, then hand it back
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        if let Some(metrics) = Metrics::global() {
            metrics
                .request_duration
                .with_label_values(&[self.operation])
                .observe(self.start.elapsed().as_secs_f64());
            metrics.requests.with_label_values(&[self.operation]).inc();
        }
        if let Err(e) = &result {
            record_failure(e);
        }
        result
    }
}

/// Count a failure under its error class
pub fn record_failure(error: &Error) {
    if let Some(metrics) = Metrics::global() {
        let kind = error.kind();
        metrics.failures.with_label_values(&[kind.as_str()]).inc();
        if kind == ErrorKind::Conflict {
            metrics.conflicts.inc();
        }
    }
}

/// Count a delete that needed a fresh revision
pub fn record_revision_refresh() {
    if let Some(metrics) = Metrics::global() {
        metrics.revision_refreshes.inc();
    }
}

/// Count a finished bulk chunk by status
pub fn record_chunk(status: ChunkStatus) {
    if let Some(metrics) = Metrics::global() {
        metrics.bulk_chunks.with_label_values(&[status.as_str()]).inc();
    }
}

/// Count one connection attempt during pool initialization
pub fn record_init_attempt() {
    if let Some(metrics) = Metrics::global() {
        metrics.pool_init_attempts.inc();
    }
}

/// Get the registry for serving metrics
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String> {
    let _ = Metrics::global();
    let encoder = prometheus::TextEncoder::new();
    Ok(encoder.encode_to_string(&registry().gather())?)
}
