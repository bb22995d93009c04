// src/core/state/stats.rs

//! Server-wide request statistics surfaced through the admin API.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counters for the serving surface.
pub struct StatsState {
    started_at: Instant,
    pub requests: AtomicU64,
    pub pass_through: AtomicU64,
    pub range_requests: AtomicU64,
    pub errors: AtomicU64,
}

/// A point-in-time view of the counters, serialized for `/admin/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub pass_through: u64,
    pub range_requests: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bypasses: u64,
    pub fallbacks: u64,
    pub artifacts_written: u64,
    pub in_flight: usize,
}

impl StatsState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            pass_through: AtomicU64::new(0),
            range_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pass_through(&self) {
        self.pass_through.fetch_add(1, Ordering::Relaxed);
        crate::core::metrics::PASS_THROUGH_TOTAL.inc();
    }

    pub fn increment_range_requests(&self) {
        self.range_requests.fetch_add(1, Ordering::Relaxed);
        crate::core::metrics::RANGE_REQUESTS_TOTAL.inc();
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for StatsState {
    fn default() -> Self {
        Self::new()
    }
}
