// src/core/state/mod.rs

//! Server-wide shared state, assembled once at startup and passed as an
//! `Arc` to every handler and background task.

mod cache;
mod core;
mod stats;

pub use cache::CacheState;
pub use core::{BackgroundTasks, LogReloadHandle, ServerState};
pub use stats::{StatsSnapshot, StatsState};
