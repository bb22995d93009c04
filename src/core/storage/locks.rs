// src/core/storage/locks.rs

//! Per-chunk exclusive locks for writers.
//!
//! Locks are in-process only. A writer that cannot obtain a lock within the
//! configured timeout forcibly releases the stale holder with a diagnostic;
//! a periodic sweeper reaps abandoned entries (see `core::tasks::lock_sweeper`).

use crate::core::metrics;
use dashmap::DashMap;
use parking_lot::Mutex as PlainMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

#[derive(Debug, Clone)]
struct LockEntry {
    mutex: Arc<Mutex<()>>,
    /// When the current holder acquired the lock, if anyone holds it.
    held_since: Arc<PlainMutex<Option<Instant>>>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            held_since: Arc::new(PlainMutex::new(None)),
        }
    }
}

/// Holds a chunk lock until dropped.
pub struct ChunkLockGuard {
    _guard: OwnedMutexGuard<()>,
    held_since: Arc<PlainMutex<Option<Instant>>>,
}

impl Drop for ChunkLockGuard {
    fn drop(&mut self) {
        *self.held_since.lock() = None;
    }
}

/// A keyed mutex map serializing writers per chunk key.
#[derive(Debug)]
pub struct ChunkLockMap {
    locks: DashMap<String, LockEntry>,
    stale_after: Duration,
}

impl ChunkLockMap {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            stale_after,
        }
    }

    /// Acquires the exclusive lock for `key`, waiting up to the stale timeout.
    /// On timeout the stale entry is forcibly replaced and acquisition retried
    /// against the fresh lock.
    pub async fn acquire(&self, key: &str) -> ChunkLockGuard {
        loop {
            let entry = self
                .locks
                .entry(key.to_string())
                .or_insert_with(LockEntry::new)
                .clone();
            metrics::CHUNK_LOCKS_HELD.set(self.locks.len() as f64);

            match tokio::time::timeout(self.stale_after, entry.mutex.clone().lock_owned()).await {
                Ok(guard) => {
                    *entry.held_since.lock() = Some(Instant::now());
                    return ChunkLockGuard {
                        _guard: guard,
                        held_since: entry.held_since,
                    };
                }
                Err(_) => {
                    warn!(chunk = %key, "chunk lock held past the stale timeout, forcing release");
                    metrics::LOCKS_FORCE_RELEASED_TOTAL.inc();
                    // Replace the entry; the stale holder keeps its guard on the
                    // orphaned mutex while new writers race for the fresh one.
                    self.locks
                        .remove_if(key, |_, candidate| Arc::ptr_eq(&candidate.mutex, &entry.mutex));
                }
            }
        }
    }

    /// Removes entries nobody holds or waits on, plus any held past the stale
    /// timeout. Returns (reaped, forced) counts for the sweeper's diagnostics.
    pub fn sweep(&self) -> (usize, usize) {
        let mut forced = 0usize;
        let before = self.locks.len();
        let stale_after = self.stale_after;
        self.locks.retain(|key, entry| {
            if let Some(held_since) = *entry.held_since.lock()
                && held_since.elapsed() > stale_after
            {
                warn!(chunk = %key, "sweeper reaping chunk lock held past the stale timeout");
                metrics::LOCKS_FORCE_RELEASED_TOTAL.inc();
                forced += 1;
                return false;
            }
            // Strong count of 1 means only the map references the mutex.
            Arc::strong_count(&entry.mutex) > 1
        });
        let after = self.locks.len();
        metrics::CHUNK_LOCKS_HELD.set(after as f64);
        (before - after, forced)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
