// src/server/admin.rs

//! The admin + metrics surface on its own port: Prometheus metrics, the
//! configuration document, manifest deletion, and version records.

use crate::config::Config;
use crate::core::metrics::gather_metrics;
use crate::core::options::{CacheKey, Fingerprint};
use crate::core::state::ServerState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    crate::core::metrics::IN_FLIGHT_ENTRIES.set(state.cache.in_flight.len() as f64);
    crate::core::metrics::CHUNK_LOCKS_HELD.set(state.cache.chunk_locks.len() as f64);
    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

async fn stats_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.stats_snapshot())
}

async fn get_config(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let config = state.config.lock().await.clone();
    Json(config)
}

/// Uploads a new configuration document (TOML text). Rules are recompiled;
/// a pattern that fails to compile keeps its rule disabled with a diagnostic,
/// exactly as at startup.
async fn put_config(State(state): State<Arc<ServerState>>, body: String) -> impl IntoResponse {
    match Config::from_toml_str(&body) {
        Ok(config) => {
            state.apply_config(config).await;
            (StatusCode::NO_CONTENT, String::new())
        }
        Err(e) => (StatusCode::BAD_REQUEST, format!("invalid configuration: {e:#}")),
    }
}

async fn delete_manifest(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let cache_key = CacheKey::from_raw(key);
    match state.store.delete_manifest(&cache_key).await {
        Ok(()) => {
            info!(cache_key = %cache_key, "manifest deleted by operator");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            error!(cache_key = %cache_key, "manifest delete failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: u64,
}

async fn put_version(
    State(state): State<Arc<ServerState>>,
    Path(fingerprint): Path<String>,
    Json(body): Json<VersionBody>,
) -> impl IntoResponse {
    let fingerprint = Fingerprint::from_raw(fingerprint);
    match state.versions.set(&fingerprint, body.version).await {
        Ok(()) => {
            info!(%fingerprint, version = body.version, "version set by operator");
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            error!(%fingerprint, "version set failed: {e}");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn delete_version(
    State(state): State<Arc<ServerState>>,
    Path(fingerprint): Path<String>,
) -> impl IntoResponse {
    let fingerprint = Fingerprint::from_raw(fingerprint);
    match state.versions.delete(&fingerprint).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!(%fingerprint, "version delete failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// The admin router, also mounted directly by tests.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/admin/stats", get(stats_handler))
        .route("/admin/config", get(get_config).put(put_config))
        .route("/admin/manifest/{*key}", delete(delete_manifest))
        .route(
            "/admin/version/{*fingerprint}",
            put(put_version).delete(delete_version),
        )
        .with_state(state)
}

/// Runs the admin server until shutdown.
pub async fn run_admin_server(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let port = {
        let config = state.config.lock().await;
        config.admin.port
    };

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("admin server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind admin server on port {}: {}", port, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("admin server shutting down.");
        })
        .await
    {
        error!("admin server error: {e}");
    }
}
