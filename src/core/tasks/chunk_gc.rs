// src/core/tasks/chunk_gc.rs

//! Garbage collection for the chunked store: expired manifests and the
//! orphan chunks left behind by aborted writes.

use crate::core::metrics;
use crate::core::options::CacheKey;
use crate::core::state::ServerState;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The interval between GC sweeps.
const GC_INTERVAL: Duration = Duration::from_secs(600);

/// The key prefix shared by all artifact manifests and chunks.
const ARTIFACT_PREFIX: &str = "video:";

/// A task that removes expired manifests (with their chunks) and orphan
/// chunks. An orphan is deleted only after it shows up in two consecutive
/// sweeps, so chunks of an in-progress write are never collected out from
/// under their writer.
pub struct ChunkGcTask {
    state: Arc<ServerState>,
    orphan_candidates: HashSet<String>,
}

impl ChunkGcTask {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            orphan_candidates: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("chunk GC task started. Sweep interval: {:?}", GC_INTERVAL);
        let mut interval = tokio::time::interval(GC_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("chunk GC sweep failed: {e}");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("chunk GC task shutting down.");
                    return;
                }
            }
        }
    }

    /// One sweep over the artifact keyspace.
    pub async fn sweep(&mut self) -> Result<(), crate::core::FramegateError> {
        let kv = Arc::clone(self.state.store.kv());
        let keys = kv.list(ARTIFACT_PREFIX).await?;

        let mut manifest_keys: HashSet<String> = HashSet::new();
        let mut chunk_keys: Vec<String> = Vec::new();
        for key in keys {
            if key.contains("_chunk_") {
                chunk_keys.push(key);
            } else {
                manifest_keys.insert(key);
            }
        }

        // Expired manifests go first, together with their chunks.
        let now = Utc::now();
        let mut expired = 0usize;
        for manifest_key in manifest_keys.clone() {
            let cache_key = CacheKey::from_raw(manifest_key.clone());
            let Some(raw) = kv.get(&manifest_key).await? else {
                manifest_keys.remove(&manifest_key);
                continue;
            };
            let Ok(manifest) =
                serde_json::from_slice::<crate::core::storage::ArtifactManifest>(&raw)
            else {
                warn!(key = %manifest_key, "undecodable manifest, removing");
                kv.delete(&manifest_key).await?;
                manifest_keys.remove(&manifest_key);
                continue;
            };
            if manifest.is_expired(now) {
                kv.delete(&manifest_key).await?;
                for chunk in &manifest.chunks {
                    kv.delete(&cache_key.chunk_key(chunk.index)).await?;
                }
                manifest_keys.remove(&manifest_key);
                expired += 1;
                metrics::GC_REMOVALS_TOTAL
                    .with_label_values(&["expired_manifest"])
                    .inc();
            }
        }

        // Orphan chunks: two-sweep confirmation before deletion.
        let mut seen_this_sweep: HashSet<String> = HashSet::new();
        let mut orphans_removed = 0usize;
        for chunk_key in chunk_keys {
            let Some(base) = chunk_key.rsplit_once("_chunk_").map(|(base, _)| base) else {
                continue;
            };
            if manifest_keys.contains(base) {
                continue;
            }
            if self.orphan_candidates.contains(&chunk_key) {
                kv.delete(&chunk_key).await?;
                orphans_removed += 1;
                metrics::GC_REMOVALS_TOTAL
                    .with_label_values(&["orphan_chunk"])
                    .inc();
            } else {
                seen_this_sweep.insert(chunk_key);
            }
        }
        self.orphan_candidates = seen_this_sweep;

        if expired > 0 || orphans_removed > 0 {
            debug!(
                "chunk GC: removed {} expired manifests and {} orphan chunks",
                expired, orphans_removed
            );
        }
        Ok(())
    }
}
