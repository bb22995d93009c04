// src/config.rs

//! Manages server configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

/// One named preset of output dimensions, selectable via `derivative=` or IMQuery hints.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivativeSpec {
    pub width: u32,
    pub height: u32,
}

fn default_derivatives() -> BTreeMap<String, DerivativeSpec> {
    BTreeMap::from([
        (
            "mobile".to_string(),
            DerivativeSpec {
                width: 640,
                height: 360,
            },
        ),
        (
            "tablet".to_string(),
            DerivativeSpec {
                width: 1280,
                height: 720,
            },
        ),
        (
            "desktop".to_string(),
            DerivativeSpec {
                width: 1920,
                height: 1080,
            },
        ),
    ])
}

/// Breakpoints for mapping Akamai IMQuery hints onto named derivatives.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ImQueryConfig {
    #[serde(default = "default_imquery_mobile_width")]
    pub mobile_max_width: u32,
    #[serde(default = "default_imquery_tablet_width")]
    pub tablet_max_width: u32,
    #[serde(default = "default_imquery_mobile_height")]
    pub mobile_max_height: u32,
    #[serde(default = "default_imquery_tablet_height")]
    pub tablet_max_height: u32,
}

fn default_imquery_mobile_width() -> u32 {
    640
}
fn default_imquery_tablet_width() -> u32 {
    1280
}
fn default_imquery_mobile_height() -> u32 {
    360
}
fn default_imquery_tablet_height() -> u32 {
    720
}

impl Default for ImQueryConfig {
    fn default() -> Self {
        Self {
            mobile_max_width: default_imquery_mobile_width(),
            tablet_max_width: default_imquery_tablet_width(),
            mobile_max_height: default_imquery_mobile_height(),
            tablet_max_height: default_imquery_tablet_height(),
        }
    }
}

/// The kind of a source within an origin rule's priority chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Bucket,
    Remote,
    Fallback,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Bucket => "bucket",
            SourceKind::Remote => "remote",
            SourceKind::Fallback => "fallback",
        }
    }
}

/// Authentication applied when fetching from a source.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceAuth {
    Bearer { token: String },
    Header { name: String, value: String },
}

/// One concrete provider of source bytes within an origin rule.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Lower value wins; sources are tried in ascending priority.
    pub priority: u32,
    /// Template rendered with the rule's named captures, e.g. `"videos/{path}"`.
    /// For `remote` and `fallback` sources this must render to a full URL;
    /// for `bucket` sources it renders to a key under the bucket endpoint.
    pub path_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SourceAuth>,
}

/// Response TTLs applied per origin status class, surfaced as `Cache-Control: max-age`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct TtlByStatus {
    #[serde(with = "humantime_serde", default = "default_ttl_ok")]
    pub ok: Duration,
    #[serde(with = "humantime_serde", default = "default_ttl_redirect")]
    pub redirect: Duration,
    #[serde(with = "humantime_serde", default = "default_ttl_client_error")]
    pub client_error: Duration,
    #[serde(with = "humantime_serde", default = "default_ttl_server_error")]
    pub server_error: Duration,
}

fn default_ttl_ok() -> Duration {
    Duration::from_secs(86_400)
}
fn default_ttl_redirect() -> Duration {
    Duration::from_secs(3_600)
}
fn default_ttl_client_error() -> Duration {
    Duration::from_secs(60)
}
fn default_ttl_server_error() -> Duration {
    Duration::from_secs(10)
}

impl Default for TtlByStatus {
    fn default() -> Self {
        Self {
            ok: default_ttl_ok(),
            redirect: default_ttl_redirect(),
            client_error: default_ttl_client_error(),
            server_error: default_ttl_server_error(),
        }
    }
}

impl TtlByStatus {
    /// Picks the TTL bucket for an HTTP status code.
    pub fn for_status(&self, status: u16) -> Duration {
        match status {
            200..=299 => self.ok,
            300..=399 => self.redirect,
            400..=499 => self.client_error,
            _ => self.server_error,
        }
    }
}

/// A declarative origin rule: a path matcher plus a prioritized source chain.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OriginRuleConfig {
    /// A unique name for the rule, reported in diagnostics.
    pub name: String,
    /// A regex with named capture groups matched against the request path.
    pub pattern: String,
    /// If false, matching requests are forwarded to the pass-through origin untouched.
    #[serde(default = "default_process_path")]
    pub process_path: bool,
    #[serde(default)]
    pub ttl: TtlByStatus,
    pub sources: Vec<SourceConfig>,
}

fn default_process_path() -> bool {
    true
}

/// Connection details for the R2-like bucket endpoint shared by all `bucket` sources.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BucketConfig {
    /// Base URL of the bucket gateway; bucket keys are appended to this.
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SourceAuth>,
}

/// Settings for the external media-transformation endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransformerConfig {
    /// The transformation endpoint. The source URL and canonical options are
    /// appended as query parameters.
    pub endpoint: String,
    #[serde(with = "humantime_serde", default = "default_transform_timeout")]
    pub request_timeout: Duration,
    /// Upper bound on how much of an upstream error body is read for classification.
    #[serde(default = "default_error_body_limit")]
    pub error_body_limit_bytes: usize,
}

fn default_transform_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_error_body_limit() -> usize {
    16 * 1024
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9100/transform".to_string(),
            request_timeout: default_transform_timeout(),
            error_body_limit_bytes: default_error_body_limit(),
        }
    }
}

/// Which durable KV backend holds manifests, chunks, and version records.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KvBackendKind {
    Memory,
    #[default]
    Disk,
}

/// Sizing and concurrency knobs for the chunked artifact cache.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheConfig {
    /// Fixed chunk window for stored artifacts.
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    /// Artifacts at or below this size are stored as a single chunk.
    #[serde(default = "default_single_entry_threshold")]
    pub single_entry_threshold_bytes: u64,
    /// Artifacts above this size are never written when background-caching a fallback.
    #[serde(default = "default_fallback_skip_threshold")]
    pub fallback_skip_threshold_bytes: u64,
    /// Hard cap: artifacts above this size always stream live, uncached.
    #[serde(default = "default_skip_threshold")]
    pub skip_threshold_bytes: u64,
    /// Parallel chunk uploads per artifact write.
    #[serde(default = "default_chunk_write_concurrency")]
    pub chunk_write_concurrency: usize,
    /// Admission cap on distinct in-flight transformations.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Chunk locks held longer than this are forcibly released.
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub lock_timeout: Duration,
    #[serde(default)]
    pub kv_backend: KvBackendKind,
    /// Directory backing the disk KV store.
    #[serde(default = "default_kv_root")]
    pub kv_root: String,
}

fn default_chunk_size() -> u64 {
    5 * 1024 * 1024
}
fn default_single_entry_threshold() -> u64 {
    20 * 1024 * 1024
}
fn default_fallback_skip_threshold() -> u64 {
    128 * 1024 * 1024
}
fn default_skip_threshold() -> u64 {
    256 * 1024 * 1024
}
fn default_chunk_write_concurrency() -> usize {
    5
}
fn default_max_in_flight() -> usize {
    100
}
fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_kv_root() -> String {
    "framegate_data/kv".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            single_entry_threshold_bytes: default_single_entry_threshold(),
            fallback_skip_threshold_bytes: default_fallback_skip_threshold(),
            skip_threshold_bytes: default_skip_threshold(),
            chunk_write_concurrency: default_chunk_write_concurrency(),
            max_in_flight: default_max_in_flight(),
            lock_timeout: default_lock_timeout(),
            kv_backend: KvBackendKind::default(),
            kv_root: default_kv_root(),
        }
    }
}

/// Configuration for the combined admin + Prometheus metrics server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

fn default_admin_enabled() -> bool {
    true
}
fn default_admin_port() -> u16 {
    8879
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: default_admin_enabled(),
            port: default_admin_port(),
        }
    }
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    /// Requests no rule claims are forwarded here unchanged, if set.
    #[serde(default)]
    pass_through_base: Option<String>,
    #[serde(default)]
    transformer: TransformerConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    bucket: BucketConfig,
    #[serde(default)]
    admin: AdminConfig,
    #[serde(default = "default_derivatives")]
    derivatives: BTreeMap<String, DerivativeSpec>,
    #[serde(default)]
    imquery: ImQueryConfig,
    #[serde(default)]
    rules: Vec<OriginRuleConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8878
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_through_base: Option<String>,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub bucket: BucketConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default_derivatives")]
    pub derivatives: BTreeMap<String, DerivativeSpec>,
    #[serde(default)]
    pub imquery: ImQueryConfig,
    #[serde(default)]
    pub rules: Vec<OriginRuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            pass_through_base: None,
            transformer: TransformerConfig::default(),
            cache: CacheConfig::default(),
            bucket: BucketConfig::default(),
            admin: AdminConfig::default(),
            derivatives: default_derivatives(),
            imquery: ImQueryConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Failed to load '{path}'"))
    }

    /// Parses and validates a configuration document from TOML text.
    /// Also used by the admin API when a new document is uploaded.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(contents).context("Failed to parse TOML")?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            pass_through_base: raw.pass_through_base,
            transformer: raw.transformer,
            cache: raw.cache,
            bucket: raw.bucket,
            admin: raw.admin,
            derivatives: raw.derivatives,
            imquery: raw.imquery,
            rules: raw.rules,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.admin.enabled {
            if self.admin.port == 0 {
                return Err(anyhow!("admin.port cannot be 0"));
            }
            if self.admin.port == self.port {
                return Err(anyhow!(
                    "admin.port cannot be the same as the main server port"
                ));
            }
        }

        url::Url::parse(&self.transformer.endpoint)
            .map_err(|e| anyhow!("transformer.endpoint is not a valid URL: {e}"))?;

        if self.cache.chunk_size_bytes == 0 {
            return Err(anyhow!("cache.chunk_size_bytes cannot be 0"));
        }
        if self.cache.chunk_write_concurrency == 0 {
            return Err(anyhow!("cache.chunk_write_concurrency cannot be 0"));
        }
        if self.cache.max_in_flight == 0 {
            return Err(anyhow!("cache.max_in_flight cannot be 0"));
        }
        if self.cache.fallback_skip_threshold_bytes > self.cache.skip_threshold_bytes {
            return Err(anyhow!(
                "cache.fallback_skip_threshold_bytes cannot exceed cache.skip_threshold_bytes"
            ));
        }
        if self.cache.kv_backend == KvBackendKind::Disk && self.cache.kv_root.trim().is_empty() {
            return Err(anyhow!("cache.kv_root cannot be empty for the disk backend"));
        }

        for (name, spec) in &self.derivatives {
            if !(10..=2000).contains(&spec.width) || !(10..=2000).contains(&spec.height) {
                return Err(anyhow!(
                    "derivative '{name}' dimensions must be within [10, 2000]"
                ));
            }
        }

        let needs_bucket = self
            .rules
            .iter()
            .flat_map(|r| r.sources.iter())
            .any(|s| s.kind == SourceKind::Bucket);
        if needs_bucket && self.bucket.base_url.is_none() {
            return Err(anyhow!(
                "a rule declares a bucket source but bucket.base_url is not configured"
            ));
        }

        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(anyhow!("rule names cannot be empty"));
            }
            if rule.sources.is_empty() && rule.process_path {
                return Err(anyhow!("rule '{}' declares no sources", rule.name));
            }
            // Pattern compilation happens at registry build time; a broken
            // regex keeps the rule loaded but non-matching with a diagnostic.
        }

        if let Some(base) = &self.pass_through_base {
            url::Url::parse(base)
                .map_err(|e| anyhow!("pass_through_base is not a valid URL: {e}"))?;
        }

        Ok(())
    }
}
