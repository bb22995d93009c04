// src/core/orchestrator/inflight.rs

//! The in-flight registry: coalesces concurrent identical requests onto one
//! shared transformation.
//!
//! The first request for a fingerprint becomes the initiator and spawns the
//! upstream work; every later request joins the same shared future. Entries
//! are reference counted and removed only when the last holder drops its
//! guard; there is no time-based cleanup.

use super::CoalescedArtifact;
use crate::core::metrics;
use crate::core::options::Fingerprint;
use crate::core::FramegateError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type SharedOutcome =
    Shared<BoxFuture<'static, Result<CoalescedArtifact, Arc<FramegateError>>>>;

#[derive(Clone)]
struct InFlightEntry {
    future: SharedOutcome,
    refs: Arc<AtomicUsize>,
}

/// Decrements the entry's refcount when dropped; the last holder removes the
/// entry. Cancelled joiners drop their guard like anyone else, so cleanup
/// needs no cooperation from the shared future.
pub struct JoinGuard {
    registry: Arc<DashMap<String, InFlightEntry>>,
    fingerprint: String,
    refs: Arc<AtomicUsize>,
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Remove only our own entry; a successor under the same
            // fingerprint must not be evicted by a stale guard.
            self.registry
                .remove_if(&self.fingerprint, |_, entry| {
                    Arc::ptr_eq(&entry.refs, &self.refs)
                });
            metrics::IN_FLIGHT_ENTRIES.set(self.registry.len() as f64);
        }
    }
}

/// The result of joining the registry for a fingerprint.
pub struct Joined {
    pub future: SharedOutcome,
    pub guard: JoinGuard,
    /// True when this request created the entry (and its closure runs the
    /// upstream work inside the shared future).
    pub initiated: bool,
}

impl std::fmt::Debug for Joined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joined")
            .field("initiated", &self.initiated)
            .finish()
    }
}

/// A process-wide map from fingerprint to shared in-flight work.
pub struct InFlightRegistry {
    entries: Arc<DashMap<String, InFlightEntry>>,
    max_entries: usize,
}

impl InFlightRegistry {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    /// Joins (or creates) the in-flight slot for `fingerprint`.
    ///
    /// New entries beyond the admission cap are rejected with
    /// `coalescing_limit`; joins to existing entries always succeed.
    pub fn join<F>(
        &self,
        fingerprint: &Fingerprint,
        initiate: F,
    ) -> Result<Joined, FramegateError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<CoalescedArtifact, Arc<FramegateError>>>,
    {
        // Admission check before taking the shard lock: len() must not be
        // called while an entry guard is held. The cap is approximate under
        // concurrent inserts, which is fine for backpressure.
        if self.entries.len() >= self.max_entries
            && !self.entries.contains_key(fingerprint.as_str())
        {
            metrics::COALESCING_REJECTS_TOTAL.inc();
            return Err(FramegateError::CoalescingLimit);
        }

        let joined = match self.entries.entry(fingerprint.as_str().to_string()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get().clone();
                entry.refs.fetch_add(1, Ordering::AcqRel);
                metrics::COALESCED_JOINS_TOTAL.inc();
                Joined {
                    future: entry.future.clone(),
                    guard: JoinGuard {
                        registry: Arc::clone(&self.entries),
                        fingerprint: fingerprint.as_str().to_string(),
                        refs: entry.refs,
                    },
                    initiated: false,
                }
            }
            Entry::Vacant(vacant) => {
                let refs = Arc::new(AtomicUsize::new(1));
                let future: SharedOutcome = initiate().shared();
                vacant.insert(InFlightEntry {
                    future: future.clone(),
                    refs: Arc::clone(&refs),
                });
                Joined {
                    future,
                    guard: JoinGuard {
                        registry: Arc::clone(&self.entries),
                        fingerprint: fingerprint.as_str().to_string(),
                        refs,
                    },
                    initiated: true,
                }
            }
        };
        metrics::IN_FLIGHT_ENTRIES.set(self.entries.len() as f64);
        Ok(joined)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::TransformOptions;
    use crate::core::orchestrator::spool::BodySpool;

    fn fp(path: &str) -> Fingerprint {
        Fingerprint::derive(path, &TransformOptions::default())
    }

    fn artifact() -> CoalescedArtifact {
        CoalescedArtifact {
            status: 200,
            content_type: "video/mp4".into(),
            content_length: Some(0),
            headers: vec![],
            spool: BodySpool::new(1024),
            cacheable: true,
        }
    }

    #[tokio::test]
    async fn second_join_shares_the_first_future() {
        let registry = InFlightRegistry::new(100);
        let fingerprint = fp("/a");

        let first = registry
            .join(&fingerprint, || {
                async move {
                    let artifact = artifact();
                    artifact.spool.finish(Ok(()));
                    Ok(artifact)
                }
                .boxed()
            })
            .unwrap();
        assert!(first.initiated);

        let second = registry
            .join(&fingerprint, || unreachable!("must join, not initiate"))
            .unwrap();
        assert!(!second.initiated);

        let a = first.future.await.unwrap();
        let b = second.future.await.unwrap();
        assert!(Arc::ptr_eq(&a.spool, &b.spool));
    }

    #[tokio::test]
    async fn entry_is_removed_when_the_last_guard_drops() {
        let registry = InFlightRegistry::new(100);
        let fingerprint = fp("/a");

        let first = registry
            .join(&fingerprint, || async move { Err(Arc::new(FramegateError::Cancelled)) }.boxed())
            .unwrap();
        let second = registry
            .join(&fingerprint, || unreachable!())
            .unwrap();
        assert_eq!(registry.len(), 1);

        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cap_rejects_new_entries_but_not_joins() {
        let registry = InFlightRegistry::new(1);
        let fingerprint = fp("/a");
        let _held = registry
            .join(&fingerprint, || {
                async move { Err(Arc::new(FramegateError::Cancelled)) }.boxed()
            })
            .unwrap();

        let err = registry
            .join(&fp("/b"), || {
                async move { Err(Arc::new(FramegateError::Cancelled)) }.boxed()
            })
            .unwrap_err();
        assert!(matches!(err, FramegateError::CoalescingLimit));

        // Joining the existing fingerprint still succeeds at the cap.
        let joined = registry.join(&fingerprint, || unreachable!()).unwrap();
        assert!(!joined.initiated);
    }
}
