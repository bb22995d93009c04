// src/core/storage/chunked_read.rs

//! The chunked read path: ordered chunk streaming with one-chunk prefetch,
//! size-drift tolerance, and range slicing.

use super::manifest::ArtifactManifest;
use super::range::{self, within_tolerance};
use super::{ChunkedStore, KvStore};
use crate::core::metrics;
use crate::core::options::CacheKey;
use crate::core::FramegateError;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

/// Adaptive per-segment timeout: range reads budget `bytes/128` ms, full reads
/// `bytes/64` ms, with fixed floors.
fn segment_timeout(bytes: u64, ranged: bool) -> Duration {
    let millis = if ranged {
        (bytes / 128).max(2000)
    } else {
        (bytes / 64).max(3000)
    };
    Duration::from_millis(millis)
}

async fn fetch_chunk(
    kv: &Arc<dyn KvStore>,
    key: &CacheKey,
    index: u32,
    timeout: Duration,
) -> Result<Bytes, FramegateError> {
    let chunk_key = key.chunk_key(index);
    let fetched = tokio::time::timeout(timeout, kv.get(&chunk_key))
        .await
        .map_err(|_| FramegateError::KvStorage(format!("timed out fetching '{chunk_key}'")))??;
    fetched.ok_or_else(|| {
        metrics::CHUNK_INTEGRITY_ERRORS_TOTAL.inc();
        FramegateError::ChunkIntegrity(format!("chunk '{chunk_key}' missing from store"))
    })
}

/// Checks a fetched chunk against its manifest entry, counting in-tolerance
/// drift and rejecting anything beyond it.
fn verify_chunk(
    key: &CacheKey,
    index: u32,
    expected: u64,
    actual: u64,
) -> Result<(), FramegateError> {
    if expected == actual {
        return Ok(());
    }
    if within_tolerance(expected, actual) {
        metrics::CHUNK_SIZE_DRIFT_TOTAL.inc();
        debug!(
            cache_key = %key,
            chunk = index,
            expected,
            actual,
            "chunk size drift within tolerance, recomputing offsets"
        );
        return Ok(());
    }
    metrics::CHUNK_INTEGRITY_ERRORS_TOTAL.inc();
    warn!(
        cache_key = %key,
        chunk = index,
        expected,
        actual,
        "chunk size drift beyond tolerance"
    );
    Err(FramegateError::ChunkIntegrity(format!(
        "chunk {index} of '{key}' stored {actual} bytes, manifest says {expected}"
    )))
}

impl ChunkedStore {
    /// Streams the artifact body in ascending chunk order.
    ///
    /// With `range = Some((start, end))` only the intersecting slice of each
    /// chunk is emitted; callers are responsible for the 206 framing. While
    /// chunk `i` is being emitted, chunk `i + 1` is prefetched; dropping the
    /// stream aborts the in-flight prefetch.
    pub fn stream_artifact(
        &self,
        key: &CacheKey,
        manifest: &ArtifactManifest,
        range: Option<(u64, u64)>,
    ) -> impl Stream<Item = Result<Bytes, FramegateError>> + Send + 'static {
        let kv = Arc::clone(&self.kv);
        let key = key.clone();
        let manifest = manifest.clone();

        try_stream! {
            let ranged = range.is_some();
            let (start, end) = range.unwrap_or((0, manifest.total_size.saturating_sub(1)));
            if manifest.total_size == 0 {
                return;
            }

            let Some((first, last)) = range::chunk_interval(&manifest, start, end) else {
                return;
            };
            let timeout = segment_timeout(manifest.chunk_size.max(1), ranged);

            // Offsets of chunks before the window come from the manifest;
            // inside the window they are recomputed from actual sizes.
            let mut offset = manifest.expected_offset(first);
            let mut index = first;
            let mut pending: Option<AbortOnDropHandle<Result<Bytes, FramegateError>>> = None;

            while index < manifest.chunk_count && offset <= end {
                let chunk = match pending.take() {
                    Some(handle) => handle
                        .await
                        .map_err(|e| FramegateError::Internal(format!("prefetch task failed: {e}")))??,
                    None => fetch_chunk(&kv, &key, index, timeout).await?,
                };

                let expected = manifest
                    .chunks
                    .get(index as usize)
                    .map(|c| c.size)
                    .unwrap_or_default();
                verify_chunk(&key, index, expected, chunk.len() as u64)?;

                // Prefetch the next chunk while this one is written out. Past
                // the expected interval the prefetch is skipped; drifted sizes
                // are handled by the loop condition fetching it eagerly.
                let next = index + 1;
                if next < manifest.chunk_count && next <= last {
                    let kv = Arc::clone(&kv);
                    let key = key.clone();
                    pending = Some(AbortOnDropHandle::new(tokio::spawn(async move {
                        fetch_chunk(&kv, &key, next, timeout).await
                    })));
                }

                if let Some((from, to)) = range::slice_within(offset, chunk.len() as u64, start, end) {
                    // Slices of a `Bytes` chunk are reference-counted views of
                    // immutable storage; no mutable aliasing can occur.
                    yield chunk.slice(from..to);
                }

                offset += chunk.len() as u64;
                index += 1;
            }
        }
    }

    /// Reads the whole artifact into memory. Test and small-object helper.
    pub async fn read_to_bytes(
        &self,
        key: &CacheKey,
        manifest: &ArtifactManifest,
    ) -> Result<Bytes, FramegateError> {
        use futures::TryStreamExt;
        let mut collected = Vec::with_capacity(manifest.total_size as usize);
        let stream = self.stream_artifact(key, manifest, None);
        futures::pin_mut!(stream);
        while let Some(chunk) = stream.try_next().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(collected))
    }
}
