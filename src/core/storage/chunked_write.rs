// src/core/storage/chunked_write.rs

//! The background chunked writer: windows a body stream into fixed chunks,
//! uploads them under per-chunk locks with bounded concurrency, and commits
//! by writing the manifest last.

use super::manifest::{ArtifactManifest, ChunkInfo, compute_etag};
use super::{ChunkedStore, KvStore, locks::ChunkLockMap};
use crate::core::metrics;
use crate::core::options::{CacheKey, Dimensions};
use crate::core::FramegateError;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Metadata accompanying one artifact write.
#[derive(Debug, Clone)]
pub struct ArtifactWriteMeta {
    pub version: u64,
    pub content_type: String,
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub derivative_dims: Option<Dimensions>,
    pub requested_dims: Option<Dimensions>,
    pub source_path: Option<String>,
    pub source_kind: Option<String>,
    pub origin_url: Option<String>,
}

/// The result of a store attempt.
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// All chunks and the manifest were written; the artifact is cached.
    Committed(ArtifactManifest),
    /// The body exceeded the skip threshold; nothing was committed.
    SkippedTooLarge { observed_bytes: u64 },
}

async fn upload_chunk(
    kv: Arc<dyn KvStore>,
    locks: Arc<ChunkLockMap>,
    key: CacheKey,
    index: u32,
    expected_len: usize,
    payload: Bytes,
) -> Result<ChunkInfo, FramegateError> {
    let chunk_key = key.chunk_key(index);
    let _lock = locks.acquire(&chunk_key).await;
    if payload.len() != expected_len {
        return Err(FramegateError::ChunkIntegrity(format!(
            "chunk {index} window is {} bytes, expected {expected_len}",
            payload.len()
        )));
    }
    let size = payload.len() as u64;
    kv.put(&chunk_key, payload).await?;
    Ok(ChunkInfo { index, size })
}

impl ChunkedStore {
    /// Streams `body` into the store under `key`.
    ///
    /// Bodies at or below the single-entry threshold are stored whole as one
    /// chunk; larger bodies are windowed into `chunk_size` chunks uploaded in
    /// parallel (bounded by the configured concurrency), each under its own
    /// chunk lock. The manifest is written only after every chunk succeeded;
    /// any upload error aborts the write with no manifest, leaving previously
    /// uploaded chunks as unreachable orphans for the GC task.
    ///
    /// Bodies above `skip_threshold` abort the write and report
    /// [`StoreOutcome::SkippedTooLarge`].
    pub async fn store_artifact<S>(
        &self,
        key: &CacheKey,
        meta: ArtifactWriteMeta,
        body: S,
        skip_threshold: u64,
    ) -> Result<StoreOutcome, FramegateError>
    where
        S: Stream<Item = Result<Bytes, FramegateError>> + Send + 'static,
    {
        let single_threshold = self.settings.single_entry_threshold_bytes;
        let mut body = Box::pin(body);

        // Spool until the single-entry question is settled: bodies that end
        // within the threshold are stored whole, without chunk windowing.
        let mut spill = BytesMut::new();
        let mut ended = false;
        while spill.len() as u64 <= single_threshold {
            match body.next().await {
                Some(Ok(bytes)) => {
                    if spill.len() as u64 + bytes.len() as u64 > skip_threshold {
                        metrics::WRITE_SKIPS_TOTAL.inc();
                        return Ok(StoreOutcome::SkippedTooLarge {
                            observed_bytes: spill.len() as u64 + bytes.len() as u64,
                        });
                    }
                    spill.extend_from_slice(&bytes);
                }
                Some(Err(e)) => {
                    metrics::WRITE_ABORTS_TOTAL.inc();
                    return Err(e);
                }
                None => {
                    ended = true;
                    break;
                }
            }
        }

        if ended {
            return self.commit_single_entry(key, meta, spill.freeze()).await;
        }

        let prefix = futures::stream::once(futures::future::ready(Ok(spill.freeze())));
        self.store_windowed(key, meta, prefix.chain(body), skip_threshold)
            .await
    }

    /// Stores a small body as a single chunk plus manifest.
    async fn commit_single_entry(
        &self,
        key: &CacheKey,
        meta: ArtifactWriteMeta,
        payload: Bytes,
    ) -> Result<StoreOutcome, FramegateError> {
        let total = payload.len() as u64;
        let info = upload_chunk(
            Arc::clone(&self.kv),
            Arc::clone(&self.locks),
            key.clone(),
            0,
            payload.len(),
            payload,
        )
        .await
        .inspect_err(|_| metrics::WRITE_ABORTS_TOTAL.inc())?;

        let manifest = self
            .commit_manifest(key, meta, total, total.max(1), vec![info])
            .await?;
        Ok(StoreOutcome::Committed(manifest))
    }

    /// Windows a large body into fixed chunks and uploads them concurrently.
    async fn store_windowed<S>(
        &self,
        key: &CacheKey,
        meta: ArtifactWriteMeta,
        body: S,
        skip_threshold: u64,
    ) -> Result<StoreOutcome, FramegateError>
    where
        S: Stream<Item = Result<Bytes, FramegateError>> + Send,
    {
        let chunk_size = self.settings.chunk_size_bytes as usize;
        let semaphore = Arc::new(Semaphore::new(self.settings.chunk_write_concurrency));
        let mut uploads: JoinSet<Result<ChunkInfo, FramegateError>> = JoinSet::new();

        // Each window is its own freshly allocated buffer; chunks never share
        // backing storage.
        let mut window = BytesMut::with_capacity(chunk_size);
        let mut next_index: u32 = 0;
        let mut total: u64 = 0;

        futures::pin_mut!(body);

        loop {
            let incoming = match body.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    warn!(cache_key = %key, "source stream failed mid-write: {e}");
                    uploads.abort_all();
                    metrics::WRITE_ABORTS_TOTAL.inc();
                    return Err(e);
                }
                None => break,
            };

            total += incoming.len() as u64;
            if total > skip_threshold {
                debug!(
                    cache_key = %key,
                    total,
                    skip_threshold,
                    "body exceeds skip threshold, not caching"
                );
                uploads.abort_all();
                metrics::WRITE_SKIPS_TOTAL.inc();
                return Ok(StoreOutcome::SkippedTooLarge {
                    observed_bytes: total,
                });
            }

            let mut remaining = &incoming[..];
            while !remaining.is_empty() {
                let take = (chunk_size - window.len()).min(remaining.len());
                window.extend_from_slice(&remaining[..take]);
                remaining = &remaining[take..];

                if window.len() == chunk_size {
                    let full =
                        std::mem::replace(&mut window, BytesMut::with_capacity(chunk_size));
                    self.dispatch_window(key, full.freeze(), next_index, &semaphore, &mut uploads)
                        .await?;
                    next_index += 1;
                }
            }
        }

        if !window.is_empty() {
            self.dispatch_window(key, window.freeze(), next_index, &semaphore, &mut uploads)
                .await?;
            next_index += 1;
        }

        let mut chunks: Vec<ChunkInfo> = Vec::with_capacity(next_index as usize);
        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok(Ok(info)) => chunks.push(info),
                Ok(Err(e)) => {
                    warn!(cache_key = %key, "chunk upload failed, aborting write: {e}");
                    uploads.abort_all();
                    metrics::WRITE_ABORTS_TOTAL.inc();
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    uploads.abort_all();
                    metrics::WRITE_ABORTS_TOTAL.inc();
                    return Err(FramegateError::Internal(format!("upload task failed: {e}")));
                }
            }
        }
        chunks.sort_by_key(|c| c.index);

        let manifest = self
            .commit_manifest(key, meta, total, self.settings.chunk_size_bytes, chunks)
            .await?;
        Ok(StoreOutcome::Committed(manifest))
    }

    /// Queues one chunk upload, waiting for an upload slot first so the
    /// number of buffered windows stays bounded.
    async fn dispatch_window(
        &self,
        key: &CacheKey,
        payload: Bytes,
        index: u32,
        semaphore: &Arc<Semaphore>,
        uploads: &mut JoinSet<Result<ChunkInfo, FramegateError>>,
    ) -> Result<(), FramegateError> {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FramegateError::Internal("upload semaphore closed".into()))?;
        let kv = Arc::clone(&self.kv);
        let locks = Arc::clone(&self.locks);
        let key = key.clone();
        let expected = payload.len();
        uploads.spawn(async move {
            let _permit = permit;
            upload_chunk(kv, locks, key, index, expected, payload).await
        });
        Ok(())
    }

    /// Writes the manifest. This is the commit point for an artifact.
    async fn commit_manifest(
        &self,
        key: &CacheKey,
        meta: ArtifactWriteMeta,
        total: u64,
        chunk_size: u64,
        chunks: Vec<ChunkInfo>,
    ) -> Result<ArtifactManifest, FramegateError> {
        let now = Utc::now();
        let manifest = ArtifactManifest {
            version: meta.version,
            total_size: total,
            chunk_count: chunks.len() as u32,
            chunk_size,
            content_type: meta.content_type,
            etag: compute_etag(key.as_str(), meta.version, total, now),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(meta.ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            chunks,
            tags: meta.tags,
            derivative_dims: meta.derivative_dims,
            requested_dims: meta.requested_dims,
            source_path: meta.source_path,
            source_kind: meta.source_kind,
            origin_url: meta.origin_url,
        };

        self.put_manifest(key, &manifest).await?;
        metrics::ARTIFACTS_WRITTEN_TOTAL.inc();
        metrics::ARTIFACT_SIZE_BYTES.observe(total as f64);
        debug!(
            cache_key = %key,
            total,
            chunk_count = manifest.chunk_count,
            "artifact committed"
        );
        Ok(manifest)
    }
}
