// src/core/storage/manifest.rs

//! Persisted record formats: artifact manifests and version records.
//!
//! A manifest is written only after every chunk is stored; its presence is the
//! commit point that makes an artifact "cached". Readers gate on it and never
//! look at bare chunks.

use crate::core::options::Dimensions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Size and position of one stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
}

/// The metadata record committing one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    pub version: u64,
    pub total_size: u64,
    pub chunk_count: u32,
    pub chunk_size: u64,
    pub content_type: String,
    pub etag: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub chunks: Vec<ChunkInfo>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivative_dims: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_dims: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
}

impl ArtifactManifest {
    /// True when the manifest's TTL has elapsed; expired manifests read as misses.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Pushes the expiry out by `ttl` from `now`. Used by the background
    /// TTL refresh after a cache hit.
    pub fn refreshed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        let mut refreshed = self.clone();
        refreshed.expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        refreshed
    }

    /// The expected byte offset where chunk `index` begins, per the manifest.
    pub fn expected_offset(&self, index: u32) -> u64 {
        self.chunks
            .iter()
            .take_while(|c| c.index < index)
            .map(|c| c.size)
            .sum()
    }
}

/// Computes the strong ETag stored in a manifest.
pub fn compute_etag(
    cache_key: &str,
    version: u64,
    total_size: u64,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cache_key.as_bytes());
    hasher.update(version.to_be_bytes());
    hasher.update(total_size.to_be_bytes());
    hasher.update(created_at.timestamp_millis().to_be_bytes());
    format!("\"{}\"", hex::encode(&hasher.finalize()[..16]))
}

/// The per-fingerprint version record, mutated only by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionRecord {
    pub fn new(version: u64, now: DateTime<Utc>) -> Self {
        Self {
            version,
            created_at: now,
            updated_at: now,
        }
    }
}
