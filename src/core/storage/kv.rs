// src/core/storage/kv.rs

//! The durable key-value backends holding manifests, chunks, and version records.

use crate::core::FramegateError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// A generic durable KV store. Values are opaque byte blobs; the chunked
/// store layers manifests and chunk layout on top of this.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, FramegateError>;
    async fn put(&self, key: &str, value: Bytes) -> Result<(), FramegateError>;
    async fn delete(&self, key: &str) -> Result<(), FramegateError>;
    /// Lists every key starting with `prefix`. Used by the GC sweep only;
    /// hot paths address keys directly.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, FramegateError>;
}

/// An in-memory store used by tests and available as a configured backend.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Bytes>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, FramegateError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), FramegateError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), FramegateError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, FramegateError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// A directory-backed store: one file per key, names url-encoded so arbitrary
/// cache keys stay filesystem-safe.
#[derive(Debug)]
pub struct DiskKvStore {
    root: PathBuf,
}

impl DiskKvStore {
    /// Opens (and creates if needed) the backing directory.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, FramegateError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(urlencoding::encode(key).as_ref())
    }
}

#[async_trait]
impl KvStore for DiskKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, FramegateError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), FramegateError> {
        // Write to a temp file and rename so readers never observe a torn value.
        let final_path = self.path_for(key);
        let tmp_path = self
            .root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), FramegateError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, FramegateError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(".tmp-") {
                continue;
            }
            let Ok(decoded) = urlencoding::decode(name) else {
                continue;
            };
            if decoded.starts_with(prefix) {
                keys.push(decoded.into_owned());
            }
        }
        Ok(keys)
    }
}
