// src/core/tasks/lock_sweeper.rs

use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The interval at which the stale lock sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A task that periodically reaps chunk lock entries nobody holds, and
/// forcibly releases locks held past the stale timeout. Forced releases
/// should be rare; each one is logged and counted.
pub struct LockSweeperTask {
    state: Arc<ServerState>,
}

impl LockSweeperTask {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Runs the sweeper loop until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "chunk lock sweeper started. Check interval: {:?}",
            SWEEP_INTERVAL
        );
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (reaped, forced) = self.state.cache.chunk_locks.sweep();
                    if reaped > 0 || forced > 0 {
                        debug!(
                            "lock sweeper: reaped {} idle entries, force-released {} stale locks",
                            reaped, forced
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("chunk lock sweeper shutting down.");
                    return;
                }
            }
        }
    }
}
