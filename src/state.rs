//! Shared application state for Axum handlers.
//!
//! Cheap to clone: configuration is behind an `Arc` and the start instant is
//! `Copy`. Per-request state never lives here; it travels in request
//! extensions as [`TraceContext`](crate::middleware::TraceContext).

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;

/// Application state shared by all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Runtime configuration.
    pub config: Arc<Config>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    /// Seconds since the state was created.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
