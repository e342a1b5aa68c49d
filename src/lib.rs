//! # Omnibus
//!
//! A request-scoped middleware pipeline for Axum. Every request gets:
//!
//! - **Rate Limiting**: fixed-window budget per client over a bounded LRU+TTL store
//! - **Deadline**: the handler races a timer and is aborted when it loses
//! - **Tracing**: a correlation id and a span carrying request fields
//! - **Normalization**: one JSON error shape for 400s, 404s, 408s, 429s and 500s,
//!   with internal details kept out of responses and headers kept out of logs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  OmnibusLayer (Identify → Rate Check → Deadline → Finalize) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (any routes) + NotHandled fallback                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CounterStore (bounded LRU with lazy TTL expiry)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use omnibus::config::PipelineOptions;
//! use omnibus::middleware::OmnibusLayer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = OmnibusLayer::new(PipelineOptions::default())?;
//!     let app = omnibus::routes::wrap(Router::new().route("/", get(|| async { "OK" })), pipeline);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! RATE_LIMIT_REQUESTS=60 RATE_LIMIT_WINDOW_MS=60000 REQUEST_TIMEOUT_MS=5000 cargo run
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::{Config, PipelineOptions};
pub use error::{AppError, AppResult, CanonicalError};
pub use middleware::OmnibusLayer;
pub use routes::build_router;
pub use state::AppState;
