// src/core/options/fingerprint.rs

//! Canonical request identity: fingerprints and the cache keys derived from them.
//!
//! A fingerprint covers the source path plus either the derivative name or the
//! explicit `{width, height, mode}` triple. Bypass tokens and IMQuery raw hints
//! never enter the fingerprint, so they cannot fragment the cache.

use super::TransformOptions;
use std::fmt;

/// The canonical identity of a transformation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already-derived fingerprint string, e.g. from an operator
    /// request addressing a version record.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Fingerprint(raw.into())
    }

    /// Derives the fingerprint for a source path and canonical options.
    pub fn derive(source_path: &str, opts: &TransformOptions) -> Self {
        let identity = match &opts.derivative {
            Some(derivative) => format!("{source_path}:derivative={derivative}"),
            None => {
                let width = opts.width.map_or_else(|| "-".into(), |w| w.to_string());
                let height = opts.height.map_or_else(|| "-".into(), |h| h.to_string());
                format!("{source_path}:w={width}:h={height}:m={}", opts.mode)
            }
        };
        Fingerprint(identity)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The durable KV key holding this fingerprint's version record.
    pub fn version_key(&self) -> String {
        format!("version-{}", self.0)
    }

    /// The cache key for the artifact this fingerprint identifies.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey(format!("video:{}", self.0))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The durable KV key addressing one artifact's manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        CacheKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The KV key of chunk `index` under this cache key.
    pub fn chunk_key(&self, index: u32) -> String {
        format!("{}_chunk_{index}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::Mode;

    #[test]
    fn derivative_wins_over_dimensions() {
        let opts = TransformOptions {
            width: Some(111),
            height: Some(222),
            derivative: Some("tablet".into()),
            ..Default::default()
        };
        let fp = Fingerprint::derive("/videos/a.mp4", &opts);
        assert_eq!(fp.as_str(), "/videos/a.mp4:derivative=tablet");
        assert_eq!(fp.cache_key().as_str(), "video:/videos/a.mp4:derivative=tablet");
    }

    #[test]
    fn dimension_fingerprints_include_mode() {
        let opts = TransformOptions {
            width: Some(640),
            height: Some(360),
            mode: Mode::Frame,
            ..Default::default()
        };
        let fp = Fingerprint::derive("/videos/a.mp4", &opts);
        assert_eq!(fp.as_str(), "/videos/a.mp4:w=640:h=360:m=frame");
    }

    #[test]
    fn chunk_and_version_keys_follow_the_layout() {
        let opts = TransformOptions {
            derivative: Some("mobile".into()),
            ..Default::default()
        };
        let fp = Fingerprint::derive("/v/clip.mp4", &opts);
        assert_eq!(fp.version_key(), "version-/v/clip.mp4:derivative=mobile");
        assert_eq!(
            fp.cache_key().chunk_key(3),
            "video:/v/clip.mp4:derivative=mobile_chunk_3"
        );
    }

    #[test]
    fn distinct_options_produce_distinct_fingerprints() {
        let a = TransformOptions {
            width: Some(640),
            height: Some(360),
            ..Default::default()
        };
        let b = TransformOptions {
            width: Some(1280),
            height: Some(720),
            ..Default::default()
        };
        assert_ne!(
            Fingerprint::derive("/v/a.mp4", &a),
            Fingerprint::derive("/v/a.mp4", &b)
        );
    }
}
