// src/core/storage/mod.rs

//! The durable chunked artifact store: manifests, chunks, locks, and the
//! read/write paths layered over a generic KV backend.

pub mod chunked_read;
pub mod chunked_write;
pub mod kv;
pub mod locks;
pub mod manifest;
pub mod range;

pub use chunked_write::{ArtifactWriteMeta, StoreOutcome};
pub use kv::{DiskKvStore, KvStore, MemoryKvStore};
pub use locks::ChunkLockMap;
pub use manifest::{ArtifactManifest, ChunkInfo, VersionRecord, compute_etag};
pub use range::{ResolvedRange, resolve_range};

use crate::config::CacheConfig;
use crate::core::FramegateError;
use crate::core::options::CacheKey;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The chunked artifact store. Cheap to clone via `Arc`; all state lives in
/// the KV backend and the shared lock map.
pub struct ChunkedStore {
    kv: Arc<dyn KvStore>,
    settings: CacheConfig,
    locks: Arc<ChunkLockMap>,
}

impl ChunkedStore {
    pub fn new(kv: Arc<dyn KvStore>, settings: CacheConfig, locks: Arc<ChunkLockMap>) -> Self {
        Self {
            kv,
            settings,
            locks,
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn settings(&self) -> &CacheConfig {
        &self.settings
    }

    /// Loads and decodes the manifest for `key`. Expired manifests read as
    /// misses; the GC task removes them later.
    pub async fn load_manifest(
        &self,
        key: &CacheKey,
    ) -> Result<Option<ArtifactManifest>, FramegateError> {
        let Some(raw) = self.kv.get(key.as_str()).await? else {
            return Ok(None);
        };
        let manifest: ArtifactManifest = serde_json::from_slice(&raw)
            .map_err(|e| FramegateError::KvStorage(format!("undecodable manifest for '{key}': {e}")))?;
        if manifest.is_expired(Utc::now()) {
            debug!(cache_key = %key, "manifest expired, treating as miss");
            return Ok(None);
        }
        Ok(Some(manifest))
    }

    /// Persists a manifest. This is the commit point for an artifact.
    pub async fn put_manifest(
        &self,
        key: &CacheKey,
        manifest: &ArtifactManifest,
    ) -> Result<(), FramegateError> {
        let encoded = serde_json::to_vec(manifest)?;
        self.kv.put(key.as_str(), Bytes::from(encoded)).await
    }

    /// Deletes the manifest only. Chunks become orphans and are left to GC;
    /// readers gate on manifest presence so they are unreachable immediately.
    pub async fn delete_manifest(&self, key: &CacheKey) -> Result<(), FramegateError> {
        self.kv.delete(key.as_str()).await
    }

    /// Pushes the manifest's expiry out by `ttl`. Invoked from a background
    /// task after a hit; never blocks a response. The manifest is re-read
    /// first so a concurrent rewrite is never clobbered by a stale snapshot.
    pub async fn refresh_ttl(
        &self,
        key: &CacheKey,
        snapshot: &ArtifactManifest,
        ttl: Duration,
    ) -> Result<(), FramegateError> {
        let Some(current) = self.load_manifest(key).await? else {
            return Ok(());
        };
        if current.version != snapshot.version || current.created_at != snapshot.created_at {
            return Ok(());
        }
        let refreshed = current.refreshed(Utc::now(), ttl);
        self.put_manifest(key, &refreshed).await
    }
}
