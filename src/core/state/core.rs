// src/core/state/core.rs

//! Defines the central `ServerState` struct, holding all shared server-wide state.

use super::cache::CacheState;
use super::stats::{StatsSnapshot, StatsState};
use crate::config::{Config, KvBackendKind};
use crate::core::fallback::OriginFetcher;
use crate::core::rules::RuleRegistry;
use crate::core::storage::{ChunkLockMap, ChunkedStore, DiskKvStore, KvStore, MemoryKvStore};
use crate::core::transformer::{HttpTransformer, Transformer};
use crate::core::versioning::VersionService;
use crate::core::FramegateError;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::info;
use tracing_subscriber::{Registry, filter::EnvFilter, reload};

/// A handle to the logging filter, allowing dynamic log level changes via the
/// admin API.
pub type LogReloadHandle = Arc<reload::Handle<EnvFilter, Registry>>;

/// The task facility for work that must outlive its originating response,
/// such as background artifact writes and TTL refreshes.
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Spawns a future decoupled from any request lifetime. Dropping the
    /// response does not cancel it; shutdown waits for it.
    pub fn schedule_after_response<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Stops accepting new tasks and waits for the in-flight ones to drain.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }
}

/// The central struct holding all shared, server-wide state.
/// Wrapped in an `Arc` and passed to every handler and background task.
pub struct ServerState {
    /// The runtime configuration, mutable through the admin API.
    pub config: Arc<Mutex<Config>>,
    /// Compiled origin rules, swapped wholesale on config upload.
    pub rules: RwLock<Arc<RuleRegistry>>,
    /// The chunked artifact store over the durable KV backend.
    pub store: Arc<ChunkedStore>,
    /// Per-fingerprint version counters.
    pub versions: VersionService,
    /// The media-transformation endpoint client.
    pub transformer: Arc<dyn Transformer>,
    /// Origin byte fetching for fallback streaming and background caching.
    pub origin: OriginFetcher,
    /// Shared HTTP client for pass-through proxying.
    pub http_client: reqwest::Client,
    /// Coalescing registry, chunk locks, and cache counters.
    pub cache: CacheState,
    /// Request counters for the admin surface.
    pub stats: StatsState,
    /// Tasks that outlive their originating response.
    pub background: BackgroundTasks,
    /// Present when running under the real binary; tests leave it unset.
    pub log_reload_handle: Option<LogReloadHandle>,
}

impl ServerState {
    /// Initializes the entire server state from the given configuration,
    /// constructing the KV backend and the HTTP transformer it names.
    pub async fn initialize(
        config: Config,
        log_reload_handle: Option<LogReloadHandle>,
    ) -> Result<Arc<Self>, FramegateError> {
        let kv: Arc<dyn KvStore> = match config.cache.kv_backend {
            KvBackendKind::Memory => {
                info!("using the in-memory KV backend");
                Arc::new(MemoryKvStore::new())
            }
            KvBackendKind::Disk => {
                info!(root = %config.cache.kv_root, "using the disk KV backend");
                Arc::new(DiskKvStore::open(&config.cache.kv_root).await?)
            }
        };
        let transformer: Arc<dyn Transformer> =
            Arc::new(HttpTransformer::new(&config.transformer)?);
        Self::initialize_with(config, kv, transformer, log_reload_handle)
    }

    /// Initializes state around injected collaborators. Tests use this to
    /// swap in a memory store and a scripted transformer.
    pub fn initialize_with(
        config: Config,
        kv: Arc<dyn KvStore>,
        transformer: Arc<dyn Transformer>,
        log_reload_handle: Option<LogReloadHandle>,
    ) -> Result<Arc<Self>, FramegateError> {
        let rules = RuleRegistry::build(&config);
        let chunk_locks = Arc::new(ChunkLockMap::new(config.cache.lock_timeout));
        let store = Arc::new(ChunkedStore::new(
            Arc::clone(&kv),
            config.cache.clone(),
            Arc::clone(&chunk_locks),
        ));
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| FramegateError::Config(format!("http client: {e}")))?;
        let max_in_flight = config.cache.max_in_flight;

        Ok(Arc::new(Self {
            config: Arc::new(Mutex::new(config)),
            rules: RwLock::new(rules),
            store,
            versions: VersionService::new(kv),
            transformer,
            origin: OriginFetcher::new(http_client.clone()),
            http_client,
            cache: CacheState::new(max_in_flight, chunk_locks),
            stats: StatsState::new(),
            background: BackgroundTasks::new(),
            log_reload_handle,
        }))
    }

    /// Applies a new configuration document: swaps the config, recompiles the
    /// rule registry, and updates the log filter when a handle is present.
    pub async fn apply_config(&self, new_config: Config) {
        let registry = RuleRegistry::build(&new_config);
        *self.rules.write() = registry;

        if let Some(handle) = &self.log_reload_handle
            && let Ok(filter) = new_config.log_level.parse::<EnvFilter>()
        {
            if let Err(e) = handle.reload(filter) {
                tracing::warn!("failed to reload log filter: {e}");
            }
        }

        let mut config = self.config.lock().await;
        *config = new_config;
        info!("configuration document applied");
    }

    /// A point-in-time statistics snapshot for the admin surface.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_seconds: self.stats.uptime_seconds(),
            requests: self.stats.requests.load(Ordering::Relaxed),
            pass_through: self.stats.pass_through.load(Ordering::Relaxed),
            range_requests: self.stats.range_requests.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            cache_hits: self.cache.hits.load(Ordering::Relaxed),
            cache_misses: self.cache.misses.load(Ordering::Relaxed),
            cache_bypasses: self.cache.bypasses.load(Ordering::Relaxed),
            fallbacks: self.cache.fallbacks.load(Ordering::Relaxed),
            artifacts_written: self.cache.writes.load(Ordering::Relaxed),
            in_flight: self.cache.in_flight.len(),
        }
    }
}
