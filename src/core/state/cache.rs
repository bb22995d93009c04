// src/core/state/cache.rs

//! Contains all state and logic related to the transformation cache pipeline.

use crate::core::metrics;
use crate::core::orchestrator::inflight::InFlightRegistry;
use crate::core::storage::ChunkLockMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Holds the coalescing registry, the chunk lock map, and the pipeline counters.
pub struct CacheState {
    /// Fingerprint-keyed coalescing of concurrent identical requests.
    pub in_flight: InFlightRegistry,
    /// Per-chunk writer locks, shared with the chunked store.
    pub chunk_locks: Arc<ChunkLockMap>,
    /// Counter for cache hits.
    pub hits: AtomicU64,
    /// Counter for cache misses.
    pub misses: AtomicU64,
    /// Counter for bypassed requests (bypass token present).
    pub bypasses: AtomicU64,
    /// Counter for responses served by the fallback handler.
    pub fallbacks: AtomicU64,
    /// Counter for artifacts committed by the background writer.
    pub writes: AtomicU64,
}

impl CacheState {
    pub fn new(max_in_flight: usize, chunk_locks: Arc<ChunkLockMap>) -> Self {
        Self {
            in_flight: InFlightRegistry::new(max_in_flight),
            chunk_locks,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Atomically increments the counter for cache hits.
    pub fn increment_hits(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::REQUESTS_TOTAL.with_label_values(&["hit"]).inc();
    }

    /// Atomically increments the counter for cache misses.
    pub fn increment_misses(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::REQUESTS_TOTAL.with_label_values(&["miss"]).inc();
    }

    /// Atomically increments the counter for bypassed requests.
    pub fn increment_bypasses(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
        metrics::REQUESTS_TOTAL.with_label_values(&["bypass"]).inc();
    }

    /// Atomically increments the counter for fallback responses.
    pub fn increment_fallbacks(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::FALLBACK_TOTAL.inc();
    }

    /// Atomically increments the counter for committed artifacts.
    pub fn increment_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}
