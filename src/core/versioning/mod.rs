// src/core/versioning/mod.rs

//! Per-fingerprint version counters used to invalidate upstream fetch URLs.
//!
//! Versions default to 1 and move only when an operator sets them; the read
//! path never creates or bumps a record, not even on storage errors.

use crate::core::options::Fingerprint;
use crate::core::storage::{KvStore, VersionRecord};
use crate::core::FramegateError;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_VERSION: u64 = 1;

/// KV-backed version records keyed `version-<fingerprint>`.
pub struct VersionService {
    kv: Arc<dyn KvStore>,
}

impl VersionService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The current version for a fingerprint, defaulting to 1.
    ///
    /// Storage failures are logged and served as the default: a missing or
    /// unreadable record must never fail a request or mutate state.
    pub async fn get(&self, fingerprint: &Fingerprint) -> u64 {
        match self.kv.get(&fingerprint.version_key()).await {
            Ok(Some(raw)) => match serde_json::from_slice::<VersionRecord>(&raw) {
                Ok(record) => record.version.max(1),
                Err(e) => {
                    warn!(fingerprint = %fingerprint, "undecodable version record, serving default: {e}");
                    DEFAULT_VERSION
                }
            },
            Ok(None) => DEFAULT_VERSION,
            Err(e) => {
                warn!(fingerprint = %fingerprint, "version read failed, serving default: {e}");
                DEFAULT_VERSION
            }
        }
    }

    /// Writes a version record. Operator-only; `created_at` survives updates.
    /// Versions are non-decreasing: lowering one is rejected (delete the
    /// record to return to the default instead).
    pub async fn set(&self, fingerprint: &Fingerprint, version: u64) -> Result<(), FramegateError> {
        if version == 0 {
            return Err(FramegateError::Validation(
                "version must be at least 1".into(),
            ));
        }
        let key = fingerprint.version_key();
        let now = Utc::now();
        let record = match self.kv.get(&key).await? {
            Some(raw) => match serde_json::from_slice::<VersionRecord>(&raw) {
                Ok(existing) => {
                    if version < existing.version {
                        return Err(FramegateError::Validation(format!(
                            "version {version} is below the current {}",
                            existing.version
                        )));
                    }
                    VersionRecord {
                        version,
                        created_at: existing.created_at,
                        updated_at: now,
                    }
                }
                Err(_) => VersionRecord::new(version, now),
            },
            None => VersionRecord::new(version, now),
        };
        let encoded = serde_json::to_vec(&record)?;
        self.kv.put(&key, Bytes::from(encoded)).await
    }

    /// Removes a version record; reads fall back to the default afterwards.
    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<(), FramegateError> {
        self.kv.delete(&fingerprint.version_key()).await
    }
}
