// src/server/mod.rs

use crate::config::Config;
use crate::core::state::{LogReloadHandle, ServerState};
use crate::core::tasks::chunk_gc::ChunkGcTask;
use crate::core::tasks::lock_sweeper::LockSweeperTask;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub mod admin;
pub mod http;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config, log_reload_handle: Option<LogReloadHandle>) -> Result<()> {
    let host = config.host.clone();
    let port = config.port;
    let admin_enabled = config.admin.enabled;

    // 1. Initialize shared state: KV backend, transformer client, registries.
    let state = ServerState::initialize(config, log_reload_handle)
        .await
        .context("server state initialization failed")?;

    // 2. Spawn the background task suite.
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(LockSweeperTask::new(Arc::clone(&state)).run(shutdown_tx.subscribe()));
    tokio::spawn(ChunkGcTask::new(Arc::clone(&state)).run(shutdown_tx.subscribe()));
    if admin_enabled {
        tokio::spawn(admin::run_admin_server(
            Arc::clone(&state),
            shutdown_tx.subscribe(),
        ));
    }

    // 3. Serve media until interrupted.
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("framegate listening on http://{addr}");

    axum::serve(listener, http::router(Arc::clone(&state)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, shutting down");
        })
        .await
        .context("media server failed")?;

    // 4. Stop background tasks and drain pending artifact writes.
    let _ = shutdown_tx.send(());
    info!(
        pending = state.background.len(),
        "draining background tasks"
    );
    state.background.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
