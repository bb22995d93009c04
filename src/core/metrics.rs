// src/core/metrics.rs

//! Defines and registers Prometheus metrics for proxy monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Request counters ---
    /// Total media requests served, labeled by cache disposition (hit/miss/bypass).
    pub static ref REQUESTS_TOTAL: CounterVec =
        register_counter_vec!("framegate_requests_total", "Total media requests served, labeled by cache disposition.", &["cache"]).unwrap();
    /// Total requests answered by the pass-through path (no matching rule).
    pub static ref PASS_THROUGH_TOTAL: Counter =
        register_counter!("framegate_pass_through_total", "Total requests forwarded to origin unchanged.").unwrap();
    /// Total range requests served from chunked storage.
    pub static ref RANGE_REQUESTS_TOTAL: Counter =
        register_counter!("framegate_range_requests_total", "Total satisfiable range requests served from cache.").unwrap();

    // --- Transformation counters ---
    /// Total invocations of the transformation endpoint.
    pub static ref TRANSFORM_CALLS_TOTAL: Counter =
        register_counter!("framegate_transform_calls_total", "Total transformation endpoint invocations.").unwrap();
    /// Total transformation failures, labeled by error class.
    pub static ref TRANSFORM_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("framegate_transform_errors_total", "Total transformation failures, labeled by error class.", &["kind"]).unwrap();
    /// Total fallback responses streamed from origin after a transformation failure.
    pub static ref FALLBACK_TOTAL: Counter =
        register_counter!("framegate_fallback_total", "Total responses served by the fallback handler.").unwrap();
    /// Total coalesced joiners that attached to an in-flight transformation.
    pub static ref COALESCED_JOINS_TOTAL: Counter =
        register_counter!("framegate_coalesced_joins_total", "Total requests that joined an in-flight transformation.").unwrap();
    /// Total requests rejected by the in-flight admission cap.
    pub static ref COALESCING_REJECTS_TOTAL: Counter =
        register_counter!("framegate_coalescing_rejects_total", "Total requests rejected by the in-flight cap.").unwrap();

    // --- Storage counters ---
    /// Total artifacts committed to the chunked store.
    pub static ref ARTIFACTS_WRITTEN_TOTAL: Counter =
        register_counter!("framegate_artifacts_written_total", "Total artifacts committed (manifest written).").unwrap();
    /// Total artifact writes aborted before the manifest commit point.
    pub static ref WRITE_ABORTS_TOTAL: Counter =
        register_counter!("framegate_write_aborts_total", "Total artifact writes aborted before commit.").unwrap();
    /// Total writes skipped because the artifact exceeded a skip threshold.
    pub static ref WRITE_SKIPS_TOTAL: Counter =
        register_counter!("framegate_write_skips_total", "Total writes skipped due to size thresholds.").unwrap();
    /// Total chunk reads whose stored size drifted from the manifest within tolerance.
    pub static ref CHUNK_SIZE_DRIFT_TOTAL: Counter =
        register_counter!("framegate_chunk_size_drift_total", "Total chunk reads with in-tolerance size drift.").unwrap();
    /// Total chunk integrity failures beyond the drift tolerance.
    pub static ref CHUNK_INTEGRITY_ERRORS_TOTAL: Counter =
        register_counter!("framegate_chunk_integrity_errors_total", "Total chunk reads rejected beyond tolerance.").unwrap();
    /// Total stale chunk locks forcibly released.
    pub static ref LOCKS_FORCE_RELEASED_TOTAL: Counter =
        register_counter!("framegate_locks_force_released_total", "Total stale chunk locks forcibly released.").unwrap();
    /// Total expired manifests and orphan chunks removed by the GC task.
    pub static ref GC_REMOVALS_TOTAL: CounterVec =
        register_counter_vec!("framegate_gc_removals_total", "Total entries removed by the GC task, labeled by kind.", &["kind"]).unwrap();

    // --- Gauges ---
    /// Number of distinct fingerprints currently in flight.
    pub static ref IN_FLIGHT_ENTRIES: Gauge =
        register_gauge!("framegate_in_flight_entries", "Distinct fingerprints currently coalescing.").unwrap();
    /// Number of chunk locks currently registered.
    pub static ref CHUNK_LOCKS_HELD: Gauge =
        register_gauge!("framegate_chunk_locks_held", "Chunk lock entries currently registered.").unwrap();

    // --- Histograms ---
    /// Latency of transformation endpoint calls in seconds.
    pub static ref TRANSFORM_LATENCY_SECONDS: Histogram =
        register_histogram!("framegate_transform_latency_seconds", "Latency of transformation endpoint calls.").unwrap();
    /// Size in bytes of committed artifacts.
    pub static ref ARTIFACT_SIZE_BYTES: Histogram = register_histogram!(
        "framegate_artifact_size_bytes",
        "Size of committed artifacts in bytes.",
        prometheus::exponential_buckets(1024.0, 4.0, 10).unwrap()
    )
    .unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let metric_families = prometheus::gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
