// src/core/orchestrator/spool.rs

//! Buffer-once multicast for coalesced responses.
//!
//! The initiator's pump task is the sole consumer of the upstream transformed
//! body; it appends each chunk here. Every response body and the background
//! writer are independent subscriptions with their own cursor, so no stream
//! is ever consumed twice and no mutable buffer is shared.
//!
//! Retention is complete up to the configured limit. Past the limit the spool
//! degrades to a bounded live window: caught-up subscribers keep streaming,
//! subscribers that fell behind the window observe `file_size_limit` and the
//! orchestrator serves them via the fallback path instead.

use crate::core::FramegateError;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Chunks kept after retention is abandoned (oversize bodies only).
const LIVE_WINDOW_CHUNKS: usize = 64;

#[derive(Debug)]
struct SpoolInner {
    chunks: VecDeque<Bytes>,
    /// Global index of `chunks.front()`.
    base: u64,
    appended: u64,
    total_bytes: u64,
    retain_all: bool,
    done: Option<Result<(), FramegateError>>,
}

/// What a subscriber sees when polling for chunk `index`.
enum Polled {
    Chunk(Bytes),
    Lagged,
    Pending,
    Finished(Result<(), FramegateError>),
}

/// A shared, append-only body buffer with independent read handles.
#[derive(Debug)]
pub struct BodySpool {
    inner: RwLock<SpoolInner>,
    limit_bytes: u64,
    progress: watch::Sender<u64>,
}

impl BodySpool {
    pub fn new(limit_bytes: u64) -> Arc<Self> {
        let (progress, _) = watch::channel(0);
        Arc::new(Self {
            inner: RwLock::new(SpoolInner {
                chunks: VecDeque::new(),
                base: 0,
                appended: 0,
                total_bytes: 0,
                retain_all: true,
                done: None,
            }),
            limit_bytes,
            progress,
        })
    }

    /// Appends one chunk. Called only by the pump task.
    pub fn push(&self, chunk: Bytes) {
        let mut inner = self.inner.write();
        if inner.done.is_some() {
            return;
        }
        inner.total_bytes += chunk.len() as u64;
        if inner.retain_all && inner.total_bytes > self.limit_bytes {
            inner.retain_all = false;
        }
        if !inner.retain_all {
            while inner.chunks.len() >= LIVE_WINDOW_CHUNKS {
                inner.chunks.pop_front();
                inner.base += 1;
            }
        }
        inner.chunks.push_back(chunk);
        inner.appended += 1;
        let appended = inner.appended;
        drop(inner);
        let _ = self.progress.send(appended);
    }

    /// Seals the spool. Subscribers drain the retained chunks, then observe
    /// the terminal result.
    pub fn finish(&self, result: Result<(), FramegateError>) {
        let mut inner = self.inner.write();
        if inner.done.is_none() {
            inner.done = Some(result);
        }
        let appended = inner.appended;
        drop(inner);
        let _ = self.progress.send(appended);
    }

    /// Bytes appended so far.
    pub fn total_bytes(&self) -> u64 {
        self.inner.read().total_bytes
    }

    /// True while every appended chunk is still retained.
    pub fn fully_retained(&self) -> bool {
        self.inner.read().retain_all
    }

    fn poll_index(&self, index: u64) -> Polled {
        let inner = self.inner.read();
        if index < inner.base {
            return Polled::Lagged;
        }
        if index < inner.base + inner.chunks.len() as u64 {
            let chunk = inner.chunks[(index - inner.base) as usize].clone();
            return Polled::Chunk(chunk);
        }
        match &inner.done {
            Some(result) => Polled::Finished(result.clone()),
            None => Polled::Pending,
        }
    }

    /// An independent readable copy of the body: replays every retained chunk,
    /// then follows live appends until the spool is sealed.
    ///
    /// The yielded `Bytes` are reference-counted views of immutable storage;
    /// subscribers never share a cursor or a mutable buffer.
    pub fn subscribe(
        self: Arc<Self>,
    ) -> impl Stream<Item = Result<Bytes, FramegateError>> + Send + 'static {
        let spool = self;
        let mut progress = spool.progress.subscribe();

        try_stream! {
            let mut index: u64 = 0;
            loop {
                match spool.poll_index(index) {
                    Polled::Chunk(chunk) => {
                        index += 1;
                        yield chunk;
                    }
                    Polled::Lagged => {
                        Err(FramegateError::FileSizeLimit(
                            "coalesced reader fell behind an uncached oversize stream".into(),
                        ))?;
                    }
                    Polled::Finished(Ok(())) => break,
                    Polled::Finished(Err(e)) => {
                        Err(e)?;
                    }
                    Polled::Pending => {
                        if progress.changed().await.is_err() {
                            // The pump vanished without sealing; surface as a fault.
                            Err(FramegateError::Internal(
                                "body spool abandoned before completion".into(),
                            ))?;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(
        stream: impl Stream<Item = Result<Bytes, FramegateError>>,
    ) -> Result<Vec<u8>, FramegateError> {
        futures::pin_mut!(stream);
        let mut out = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn late_subscribers_replay_from_the_start() {
        let spool = BodySpool::new(1024 * 1024);
        spool.push(Bytes::from_static(b"hello "));
        spool.push(Bytes::from_static(b"world"));
        spool.finish(Ok(()));

        let a = collect(Arc::clone(&spool).subscribe()).await.unwrap();
        let b = collect(Arc::clone(&spool).subscribe()).await.unwrap();
        assert_eq!(a, b"hello world");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn subscribers_follow_live_appends() {
        let spool = BodySpool::new(1024 * 1024);
        let reader = tokio::spawn({
            let spool = Arc::clone(&spool);
            async move { collect(Arc::clone(&spool).subscribe()).await }
        });
        for _ in 0..10 {
            spool.push(Bytes::from_static(b"x"));
            tokio::task::yield_now().await;
        }
        spool.finish(Ok(()));
        let collected = reader.await.unwrap().unwrap();
        assert_eq!(collected.len(), 10);
    }

    #[tokio::test]
    async fn terminal_errors_reach_subscribers() {
        let spool = BodySpool::new(1024 * 1024);
        spool.push(Bytes::from_static(b"partial"));
        spool.finish(Err(FramegateError::ServerError { status: 502 }));
        let err = collect(Arc::clone(&spool).subscribe()).await.unwrap_err();
        assert!(matches!(err, FramegateError::ServerError { status: 502 }));
    }

    #[tokio::test]
    async fn overflow_drops_retention_and_lagged_readers_fail() {
        let spool = BodySpool::new(16);
        for _ in 0..(LIVE_WINDOW_CHUNKS + 8) {
            spool.push(Bytes::from_static(b"0123456789"));
        }
        spool.finish(Ok(()));
        assert!(!spool.fully_retained());
        let err = collect(Arc::clone(&spool).subscribe()).await.unwrap_err();
        assert!(matches!(err, FramegateError::FileSizeLimit(_)));
    }
}
