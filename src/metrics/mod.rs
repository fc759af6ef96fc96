//! Prometheus metrics registration and export.
//!
//! All metrics live behind `OnceLock` statics and are registered once at
//! startup by [`init_metrics`]. Recording helpers are safe to call before
//! initialization (they no-op), so library code never has to care whether
//! the process wired up metrics.

use std::sync::OnceLock;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};

/// Global registry for all taskfleet metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs reaching a terminal status, labeled by status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs dispatched to workers.
pub static DISPATCHES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Current queue depth.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Workers currently registered with the hub.
pub static CONNECTED_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Pool sizes, labeled by pool name.
pub static POOL_SIZE: OnceLock<GaugeVec> = OnceLock::new();

/// Artifact cache hits across all sessions.
pub static CACHE_HITS: OnceLock<Counter> = OnceLock::new();

/// Artifact transfers that could not be served from cache.
pub static CACHE_MISSES: OnceLock<Counter> = OnceLock::new();

/// Compressed artifact bytes streamed to workers.
pub static ARTIFACT_BYTES: OnceLock<Counter> = OnceLock::new();

/// Wall-clock duration of complete staging exchanges, in seconds.
pub static STAGING_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Times a zstd hint fell back to gzip for an unsupporting worker.
pub static ZSTD_FALLBACKS: OnceLock<Counter> = OnceLock::new();

/// Auto-scaler decisions, labeled by action.
pub static SCALER_DECISIONS: OnceLock<CounterVec> = OnceLock::new();

/// Initializes and registers all metrics. Call once at startup.
///
/// # Errors
///
/// Returns a `prometheus::Error` on duplicate registration.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("taskfleet_jobs_total", "Jobs reaching a terminal status"),
        &["status"],
    )?;
    let dispatches_total =
        Counter::new("taskfleet_dispatches_total", "Jobs dispatched to workers")?;
    let queue_depth = Gauge::new("taskfleet_queue_depth", "Jobs currently queued")?;
    let connected_workers = Gauge::new(
        "taskfleet_connected_workers",
        "Workers currently registered with the hub",
    )?;
    let pool_size = GaugeVec::new(
        Opts::new("taskfleet_pool_size", "Current pool sizes"),
        &["pool"],
    )?;
    let cache_hits = Counter::new("taskfleet_cache_hits_total", "Artifact cache hits")?;
    let cache_misses = Counter::new("taskfleet_cache_misses_total", "Artifact cache misses")?;
    let artifact_bytes = Counter::new(
        "taskfleet_artifact_bytes_total",
        "Compressed artifact bytes streamed to workers",
    )?;
    let staging_duration = Histogram::with_opts(
        HistogramOpts::new(
            "taskfleet_staging_duration_seconds",
            "Duration of complete staging exchanges",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
    )?;
    let zstd_fallbacks = Counter::new(
        "taskfleet_zstd_fallbacks_total",
        "Transfers downgraded from zstd to gzip",
    )?;
    let scaler_decisions = CounterVec::new(
        Opts::new("taskfleet_scaler_decisions_total", "Auto-scaler decisions"),
        &["action"],
    )?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(dispatches_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(connected_workers.clone()))?;
    registry.register(Box::new(pool_size.clone()))?;
    registry.register(Box::new(cache_hits.clone()))?;
    registry.register(Box::new(cache_misses.clone()))?;
    registry.register(Box::new(artifact_bytes.clone()))?;
    registry.register(Box::new(staging_duration.clone()))?;
    registry.register(Box::new(zstd_fallbacks.clone()))?;
    registry.register(Box::new(scaler_decisions.clone()))?;

    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = DISPATCHES_TOTAL.set(dispatches_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = CONNECTED_WORKERS.set(connected_workers);
    let _ = POOL_SIZE.set(pool_size);
    let _ = CACHE_HITS.set(cache_hits);
    let _ = CACHE_MISSES.set(cache_misses);
    let _ = ARTIFACT_BYTES.set(artifact_bytes);
    let _ = STAGING_DURATION.set(staging_duration);
    let _ = ZSTD_FALLBACKS.set(zstd_fallbacks);
    let _ = REGISTRY.set(registry);
    let _ = SCALER_DECISIONS.set(scaler_decisions);

    Ok(())
}

/// Renders all registered metrics in the Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Records a terminal job status.
pub fn record_job_terminal(status: &str) {
    if let Some(counter) = JOBS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Records one dispatch.
pub fn record_dispatch() {
    if let Some(counter) = DISPATCHES_TOTAL.get() {
        counter.inc();
    }
}

/// Updates the queue depth gauge.
pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.set(depth as f64);
    }
}

/// Updates the connected workers gauge.
pub fn set_connected_workers(count: usize) {
    if let Some(gauge) = CONNECTED_WORKERS.get() {
        gauge.set(count as f64);
    }
}

/// Updates a pool size gauge.
pub fn set_pool_size(pool: &str, size: u32) {
    if let Some(gauge) = POOL_SIZE.get() {
        gauge.with_label_values(&[pool]).set(size as f64);
    }
}

/// Records an artifact cache hit.
pub fn record_cache_hit() {
    if let Some(counter) = CACHE_HITS.get() {
        counter.inc();
    }
}

/// Records an artifact cache miss.
pub fn record_cache_miss() {
    if let Some(counter) = CACHE_MISSES.get() {
        counter.inc();
    }
}

/// Records streamed artifact bytes.
pub fn record_artifact_bytes(bytes: u64) {
    if let Some(counter) = ARTIFACT_BYTES.get() {
        counter.inc_by(bytes as f64);
    }
}

/// Records a completed staging exchange duration.
pub fn observe_staging_duration(seconds: f64) {
    if let Some(histogram) = STAGING_DURATION.get() {
        histogram.observe(seconds);
    }
}

/// Records a zstd-to-gzip downgrade.
pub fn record_zstd_fallback() {
    if let Some(counter) = ZSTD_FALLBACKS.get() {
        counter.inc();
    }
}

/// Records an auto-scaler decision.
pub fn record_scaler_decision(action: &str) {
    if let Some(counter) = SCALER_DECISIONS.get() {
        counter.with_label_values(&[action]).inc();
    }
}
