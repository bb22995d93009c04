// src/core/orchestrator/mod.rs

//! The cache orchestrator: the serve pipeline for one media request.
//!
//! Bypass short-circuit, version attach, chunked read with range handling,
//! miss coalescing through the in-flight registry, initiator transform with
//! fallback decisions, and background storage that never blocks a response.

pub mod inflight;
pub mod response;
pub mod spool;

pub use response::{MediaResponse, ResponseBody};

use crate::core::fallback::fallback_headers;
use crate::core::options::{
    self, Fingerprint, TimeSpec, TransformOptions, CacheKey,
};
use crate::core::rules::{ResolvedSource, RuleMatch};
use crate::core::state::ServerState;
use crate::core::storage::{ArtifactManifest, ArtifactWriteMeta, ResolvedRange, StoreOutcome};
use crate::core::transformer::{TransformRequest, TransformSuccess};
use crate::core::FramegateError;
use async_stream::try_stream;
use bytes::Bytes;
use futures::{FutureExt, StreamExt, TryStreamExt};
use futures::stream::BoxStream;
use inflight::JoinGuard;
use response::{cache_control_value, error_response, not_modified, range_not_satisfiable};
use sha2::{Digest, Sha256};
use spool::BodySpool;
use std::sync::Arc;
use tracing::{debug, warn};

/// The request method; anything else is rejected by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Head,
}

/// A normalized media request handed over by the dispatcher.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub method: RequestMethod,
    pub path: String,
    pub query_pairs: Vec<(String, String)>,
    pub range: Option<String>,
    pub if_none_match: Option<String>,
}

/// The shared result of one coalesced transformation: response framing plus
/// the multicast body spool every consumer subscribes to independently.
#[derive(Clone)]
pub struct CoalescedArtifact {
    pub status: u16,
    pub content_type: String,
    pub content_length: Option<u64>,
    /// Diagnostic and fallback headers contributed by the initiator.
    pub headers: Vec<(String, String)>,
    pub spool: Arc<BodySpool>,
    /// False for fallback and bypass bodies, which must not read as cached.
    pub cacheable: bool,
}

/// Serves one request that matched a processing rule.
pub async fn serve(
    state: &Arc<ServerState>,
    request: MediaRequest,
    rule: RuleMatch,
) -> MediaResponse {
    state.stats.increment_requests();

    let parsed = {
        let config = state.config.lock().await;
        TransformOptions::from_query_pairs(&request.query_pairs, &config)
    };
    let mut opts = match parsed {
        Ok(opts) => opts,
        Err(e) => {
            state.stats.increment_errors();
            return error_response(&e);
        }
    };

    let fingerprint = Fingerprint::derive(&request.path, &opts);
    let cache_key = fingerprint.cache_key();

    if options::has_bypass_token(&request.query_pairs) {
        state.cache.increment_bypasses();
        return serve_bypass(state, &request, rule, opts, fingerprint, cache_key).await;
    }

    opts.version = state.versions.get(&fingerprint).await;

    match state.store.load_manifest(&cache_key).await {
        Ok(Some(manifest)) if manifest.version == opts.version => {
            return serve_hit(state, &request, &rule, &cache_key, manifest).await;
        }
        Ok(Some(manifest)) => {
            debug!(
                cache_key = %cache_key,
                cached = manifest.version,
                current = opts.version,
                "cached artifact is from an older version, refetching"
            );
        }
        Ok(None) => {}
        Err(e) => {
            warn!(cache_key = %cache_key, "manifest read failed, treating as miss: {e}");
        }
    }

    state.cache.increment_misses();
    serve_miss(state, &request, rule, opts, fingerprint, cache_key).await
}

/// A hit: range handling, conditional requests, and a non-blocking TTL refresh.
async fn serve_hit(
    state: &Arc<ServerState>,
    request: &MediaRequest,
    rule: &RuleMatch,
    cache_key: &CacheKey,
    manifest: ArtifactManifest,
) -> MediaResponse {
    state.cache.increment_hits();

    // TTL refresh never blocks the response.
    {
        let store = Arc::clone(&state.store);
        let key = cache_key.clone();
        let snapshot = manifest.clone();
        let ttl = rule.ttl.ok;
        state.background.schedule_after_response(async move {
            if let Err(e) = store.refresh_ttl(&key, &snapshot, ttl).await {
                debug!(cache_key = %key, "manifest TTL refresh failed: {e}");
            }
        });
    }

    let cache_control = cache_control_value(rule.ttl.for_status(200));

    if let Some(tag) = &request.if_none_match
        && tag.trim() == manifest.etag
    {
        return not_modified(&manifest.etag, cache_control)
            .header("X-Origin", rule.rule_name.clone());
    }

    let base = MediaResponse::new(200)
        .header("Content-Type", manifest.content_type.clone())
        .header("Accept-Ranges", "bytes")
        .header("ETag", manifest.etag.clone())
        .header("Cache-Control", cache_control)
        .header("X-Cache", "HIT")
        .header("X-Origin", rule.rule_name.clone())
        .header(
            "X-Source-Type",
            manifest.source_kind.clone().unwrap_or_else(|| "unknown".into()),
        );

    let total = manifest.total_size;
    if let Some(range_header) = &request.range {
        match crate::core::storage::resolve_range(range_header, total) {
            Some(ResolvedRange::Unsatisfiable) => {
                return range_not_satisfiable(total)
                    .header("X-Cache", "HIT")
                    .header("X-Origin", rule.rule_name.clone());
            }
            Some(ResolvedRange::Satisfiable { start, end }) => {
                state.stats.increment_range_requests();
                let mut partial = base;
                partial.status = 206;
                partial = partial
                    .header("Content-Range", format!("bytes {start}-{end}/{total}"))
                    .header("Content-Length", (end - start + 1).to_string());
                if request.method == RequestMethod::Head {
                    return partial.into_head();
                }
                let stream = state
                    .store
                    .stream_artifact(cache_key, &manifest, Some((start, end)));
                return partial.stream(stream.boxed());
            }
            None => {
                // Malformed or multipart: fall through to the full representation.
            }
        }
    }

    let full = base.header("Content-Length", total.to_string());
    if request.method == RequestMethod::Head {
        return full.into_head();
    }
    let stream = state.store.stream_artifact(cache_key, &manifest, None);
    full.stream(stream.boxed())
}

/// A miss: join or create the in-flight slot, then stream the shared result.
async fn serve_miss(
    state: &Arc<ServerState>,
    request: &MediaRequest,
    rule: RuleMatch,
    opts: TransformOptions,
    fingerprint: Fingerprint,
    cache_key: CacheKey,
) -> MediaResponse {
    let joined = {
        let initiator_state = Arc::clone(state);
        let initiator_rule = rule.clone();
        let initiator_opts = opts.clone();
        let initiator_fp = fingerprint.clone();
        let initiator_key = cache_key.clone();
        let source_path = request.path.clone();
        state.cache.in_flight.join(&fingerprint, move || {
            async move {
                run_initiator(
                    initiator_state,
                    initiator_rule,
                    initiator_opts,
                    initiator_fp,
                    initiator_key,
                    source_path,
                    true,
                )
                .await
                .map_err(Arc::new)
            }
            .boxed()
        })
    };

    let joined = match joined {
        Ok(joined) => joined,
        Err(e) => {
            state.stats.increment_errors();
            return error_response(&e);
        }
    };

    match joined.future.clone().await {
        Ok(artifact) => {
            artifact_response(state, request, &rule, artifact, Some(joined.guard), "MISS").await
        }
        Err(shared_error) => {
            state.stats.increment_errors();
            error_response(&shared_error)
        }
    }
}

/// A bypassed request: straight to the transformer, no cache read or write,
/// no coalescing.
async fn serve_bypass(
    state: &Arc<ServerState>,
    request: &MediaRequest,
    rule: RuleMatch,
    opts: TransformOptions,
    fingerprint: Fingerprint,
    cache_key: CacheKey,
) -> MediaResponse {
    match run_initiator(
        Arc::clone(state),
        rule.clone(),
        opts,
        fingerprint,
        cache_key,
        request.path.clone(),
        false,
    )
    .await
    {
        Ok(artifact) => artifact_response(state, request, &rule, artifact, None, "BYPASS").await,
        Err(e) => {
            state.stats.increment_errors();
            error_response(&e)
        }
    }
}

/// Builds one consumer's response from the shared artifact. The join guard is
/// carried inside the body stream so the in-flight entry survives until this
/// consumer finishes (or abandons) its copy.
async fn artifact_response(
    state: &Arc<ServerState>,
    request: &MediaRequest,
    rule: &RuleMatch,
    artifact: CoalescedArtifact,
    guard: Option<JoinGuard>,
    x_cache: &str,
) -> MediaResponse {
    // An oversize body that already shed its retained prefix cannot be
    // replayed for this consumer; serve origin bytes instead.
    if !artifact.spool.fully_retained() {
        return consumer_origin_fallback(state, request, rule, x_cache).await;
    }

    let mut response = MediaResponse::new(artifact.status)
        .header("Content-Type", artifact.content_type.clone())
        .header("X-Cache", x_cache)
        .header("X-Origin", rule.rule_name.clone())
        .headers(artifact.headers.clone());

    if response.header_value("Accept-Ranges").is_none() {
        response = response.header("Accept-Ranges", "bytes");
    }
    if response.header_value("Cache-Control").is_none() {
        let value = if artifact.cacheable && x_cache != "BYPASS" {
            cache_control_value(rule.ttl.for_status(artifact.status))
        } else {
            "no-store".to_string()
        };
        response = response.header("Cache-Control", value);
    }
    if response.header_value("ETag").is_none() {
        response = response.header("ETag", weak_etag(rule, request));
    }
    if let Some(length) = artifact.content_length {
        response = response.header("Content-Length", length.to_string());
    }

    if request.method == RequestMethod::Head {
        return response.into_head();
    }

    let body = Arc::clone(&artifact.spool).subscribe();
    match guard {
        Some(guard) => response.stream(hold_guard(guard, body)),
        None => response.stream(body.boxed()),
    }
}

/// The initiator: re-reads the version, walks the source chain through the
/// transformer with the fallback decision table, and launches the pump and
/// background writer for the winning body.
async fn run_initiator(
    state: Arc<ServerState>,
    rule: RuleMatch,
    mut opts: TransformOptions,
    fingerprint: Fingerprint,
    cache_key: CacheKey,
    source_path: String,
    allow_store: bool,
) -> Result<CoalescedArtifact, FramegateError> {
    // The version may have moved between option construction and this point.
    opts.version = state.versions.get(&fingerprint).await;

    let mut extra_headers: Vec<(String, String)> = Vec::new();
    let mut duration_adjusted = false;
    let mut source_index = 0usize;
    let mut last_not_found: Option<FramegateError> = None;

    loop {
        let Some(source) = rule.sources.get(source_index) else {
            return Err(last_not_found.unwrap_or_else(|| {
                FramegateError::NotFound(format!(
                    "rule '{}' has no source for '{source_path}'",
                    rule.rule_name
                ))
            }));
        };

        let transform_request = TransformRequest {
            source_url: source.url.clone(),
            opts: opts.clone(),
        };
        match state.transformer.transform(transform_request).await {
            Ok(success) => {
                extra_headers.push(("X-Source-Type".into(), source.kind.as_str().into()));
                return Ok(launch_streaming(
                    &state,
                    &rule,
                    &opts,
                    &cache_key,
                    &source_path,
                    source,
                    success,
                    allow_store,
                    extra_headers,
                ));
            }
            Err(FramegateError::DurationLimit { max_seconds })
                if !duration_adjusted && opts.duration.is_some() =>
            {
                let original = opts.duration.unwrap_or(TimeSpec::from_seconds(0.0));
                let adjusted = TimeSpec::from_seconds(max_seconds as f64);
                debug!(
                    fingerprint = %fingerprint,
                    %original,
                    %adjusted,
                    "duration exceeds upstream bound, retrying adjusted"
                );
                extra_headers.push(("X-Duration-Adjusted".into(), "true".into()));
                extra_headers.push(("X-Original-Duration".into(), original.to_string()));
                extra_headers.push(("X-Adjusted-Duration".into(), adjusted.to_string()));
                opts.duration = Some(adjusted);
                duration_adjusted = true;
            }
            Err(e @ FramegateError::NotFound(_)) => {
                debug!(source = %source.url, "source not found at transformer, trying next");
                last_not_found = Some(e);
                source_index += 1;
            }
            Err(FramegateError::RateLimit) => return Err(FramegateError::RateLimit),
            Err(e) if fallback_eligible(&e) => {
                return stream_origin_fallback(
                    &state,
                    &rule,
                    &cache_key,
                    &opts,
                    e,
                    allow_store,
                    extra_headers,
                )
                .await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether a transformer failure falls back to origin streaming (§4.8 table).
fn fallback_eligible(error: &FramegateError) -> bool {
    matches!(
        error,
        FramegateError::FileSizeLimit(_)
            | FramegateError::UnsupportedFormat(_)
            | FramegateError::ServerError { .. }
            | FramegateError::HttpClient(_)
            | FramegateError::ParameterError(_)
            | FramegateError::SeekTimeError(_)
            | FramegateError::InvalidModeError(_)
            | FramegateError::FormatError(_)
            | FramegateError::DurationLimit { .. }
    )
}

/// Starts the pump (sole consumer of the upstream body) and, when permitted,
/// the background writer, both decoupled from the request lifetime.
#[allow(clippy::too_many_arguments)]
fn launch_streaming(
    state: &Arc<ServerState>,
    rule: &RuleMatch,
    opts: &TransformOptions,
    cache_key: &CacheKey,
    source_path: &str,
    source: &ResolvedSource,
    success: TransformSuccess,
    allow_store: bool,
    headers: Vec<(String, String)>,
) -> CoalescedArtifact {
    let spool = BodySpool::new(state.store.settings().skip_threshold_bytes);
    pump_into_spool(state, success.body, Arc::clone(&spool));

    if allow_store {
        let mut tags = vec![format!("path:{source_path}")];
        if let Some(derivative) = &opts.derivative {
            tags.push(format!("derivative:{derivative}"));
        }
        let meta = ArtifactWriteMeta {
            version: opts.version,
            content_type: success.content_type.clone(),
            ttl: rule.ttl.ok,
            tags,
            derivative_dims: opts.derivative_dims,
            requested_dims: opts.requested_dims(),
            source_path: Some(source_path.to_string()),
            source_kind: Some(source.kind.as_str().to_string()),
            origin_url: Some(source.url.clone()),
        };
        spawn_writer(
            state,
            cache_key.clone(),
            meta,
            Arc::clone(&spool),
            state.store.settings().skip_threshold_bytes,
        );
    }

    CoalescedArtifact {
        status: 200,
        content_type: success.content_type,
        content_length: success.content_length,
        headers,
        spool,
        cacheable: allow_store,
    }
}

/// Streams origin bytes after a transformer failure, with the mandated
/// fallback headers. 5xx fallbacks are opportunistically background-cached
/// under the fallback skip threshold.
async fn stream_origin_fallback(
    state: &Arc<ServerState>,
    rule: &RuleMatch,
    cache_key: &CacheKey,
    opts: &TransformOptions,
    error: FramegateError,
    allow_store: bool,
    mut headers: Vec<(String, String)>,
) -> Result<CoalescedArtifact, FramegateError> {
    state.cache.increment_fallbacks();
    warn!(rule = %rule.rule_name, "transformation failed, streaming origin bytes: {error}");

    let origin = match state.origin.fetch_chain(&rule.sources).await {
        Ok(origin) => origin,
        Err(FramegateError::NotFound(reason)) => {
            return Err(FramegateError::NotFound(reason));
        }
        Err(fetch_error) => {
            warn!("origin fallback fetch failed: {fetch_error}");
            return Err(error);
        }
    };

    headers.extend(fallback_headers(&error));
    headers.push(("X-Error-Status".into(), error.http_status().to_string()));
    headers.push(("X-Error-Type".into(), error.error_type().into()));
    headers.push(("X-Source-Type".into(), origin.source_kind.into()));

    let spool = BodySpool::new(state.store.settings().skip_threshold_bytes);
    pump_into_spool(state, origin.body, Arc::clone(&spool));

    // Only transformer faults get their origin bytes cached: during an
    // outage window the artifact serves origin bytes under the short
    // server-error TTL, then expires and the transform is retried.
    if allow_store && matches!(error, FramegateError::ServerError { .. }) {
        let meta = ArtifactWriteMeta {
            version: opts.version,
            content_type: origin.content_type.clone(),
            ttl: rule.ttl.server_error,
            tags: vec!["fallback".to_string()],
            derivative_dims: None,
            requested_dims: None,
            source_path: None,
            source_kind: Some(origin.source_kind.to_string()),
            origin_url: Some(origin.source_url.clone()),
        };
        spawn_writer(
            state,
            cache_key.clone(),
            meta,
            Arc::clone(&spool),
            state.store.settings().fallback_skip_threshold_bytes,
        );
    }

    Ok(CoalescedArtifact {
        status: 200,
        content_type: origin.content_type,
        content_length: origin.content_length,
        headers,
        spool,
        cacheable: false,
    })
}

/// Serves one consumer origin bytes directly when the shared spool can no
/// longer replay for it (oversize artifact shedding).
async fn consumer_origin_fallback(
    state: &Arc<ServerState>,
    request: &MediaRequest,
    rule: &RuleMatch,
    x_cache: &str,
) -> MediaResponse {
    state.cache.increment_fallbacks();
    let error =
        FramegateError::FileSizeLimit("artifact exceeds the coalesce retention limit".into());
    match state.origin.fetch_chain(&rule.sources).await {
        Ok(origin) => {
            let mut response = MediaResponse::new(200)
                .header("Content-Type", origin.content_type)
                .header("X-Cache", x_cache)
                .header("X-Origin", rule.rule_name.clone())
                .headers(fallback_headers(&error))
                .header("X-Error-Status", error.http_status().to_string())
                .header("X-Error-Type", error.error_type())
                .header("X-Source-Type", origin.source_kind);
            if let Some(length) = origin.content_length {
                response = response.header("Content-Length", length.to_string());
            }
            if request.method == RequestMethod::Head {
                return response.into_head();
            }
            response.stream(origin.body)
        }
        Err(e) => {
            state.stats.increment_errors();
            error_response(&e)
        }
    }
}

/// Spawns the pump task: the sole consumer of an upstream body, fanning its
/// chunks into the spool. Client disconnects never cancel it.
fn pump_into_spool(
    state: &Arc<ServerState>,
    body: BoxStream<'static, Result<Bytes, FramegateError>>,
    spool: Arc<BodySpool>,
) {
    let mut body = body;
    state.background.schedule_after_response(async move {
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => spool.push(chunk),
                Ok(None) => {
                    spool.finish(Ok(()));
                    break;
                }
                Err(e) => {
                    debug!("upstream body failed mid-stream: {e}");
                    spool.finish(Err(e));
                    break;
                }
            }
        }
    });
}

/// Spawns the background writer over its own spool subscription.
/// Writer failures are logged and never reach the live response.
fn spawn_writer(
    state: &Arc<ServerState>,
    cache_key: CacheKey,
    meta: ArtifactWriteMeta,
    spool: Arc<BodySpool>,
    skip_threshold: u64,
) {
    let task_state = Arc::clone(state);
    let subscription = Arc::clone(&spool).subscribe();
    state.background.schedule_after_response(async move {
        match task_state
            .store
            .store_artifact(&cache_key, meta, subscription, skip_threshold)
            .await
        {
            Ok(StoreOutcome::Committed(manifest)) => {
                task_state.cache.increment_writes();
                debug!(
                    cache_key = %cache_key,
                    total = manifest.total_size,
                    "background write committed"
                );
            }
            Ok(StoreOutcome::SkippedTooLarge { observed_bytes }) => {
                debug!(
                    cache_key = %cache_key,
                    observed_bytes,
                    "background write skipped oversize artifact"
                );
            }
            Err(e) => {
                warn!(cache_key = %cache_key, "background artifact write failed: {e}");
            }
        }
    });
}

/// A stable weak validator for responses that stream ahead of the manifest.
fn weak_etag(rule: &RuleMatch, request: &MediaRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule.rule_name.as_bytes());
    hasher.update(request.path.as_bytes());
    for (key, value) in &request.query_pairs {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }
    format!("W/\"{}\"", hex::encode(&hasher.finalize()[..12]))
}

/// Wraps a body stream so the join guard lives exactly as long as this
/// consumer's copy of the shared response.
fn hold_guard<S>(guard: JoinGuard, body: S) -> BoxStream<'static, Result<Bytes, FramegateError>>
where
    S: futures::Stream<Item = Result<Bytes, FramegateError>> + Send + 'static,
{
    try_stream! {
        let _guard = guard;
        futures::pin_mut!(body);
        while let Some(chunk) = body.try_next().await? {
            yield chunk;
        }
    }
    .boxed()
}
