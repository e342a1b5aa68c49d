//! Application routing configuration with the request pipeline.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Identify     │ ← X-Request-Id reused or generated, request span bound
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded (X-RateLimit-* on every response)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Deadline     │ ← 408 if the handler is too slow
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler  ──→  fallback: NotHandled (404)
//! ```
//!
//! All of the above is one [`OmnibusLayer`]; failures from any stage are
//! normalized into the same JSON error body.
//!
//! # Routes
//!
//! - `/health` - Health check
//! - `/`, `/fail`, `/bad-request/{*path}`, `/slow`, `/context` - Demo endpoints

use axum::Router;
use axum::routing::get;
use tracing::info;

use crate::error::AppResult;
use crate::handlers;
use crate::middleware::{OmnibusLayer, not_handled};
use crate::state::AppState;

/// Build the application router with all routes and the pipeline configured.
///
/// # Errors
///
/// Returns `AppError` if the pipeline configuration is invalid.
pub fn build_router(state: AppState) -> AppResult<Router> {
    let pipeline = OmnibusLayer::from_config(&state.config)?;
    Ok(wrap(demo_routes(), pipeline).with_state(state))
}

/// Wrap any router with the pipeline and the `NotHandled` fallback.
///
/// Use this to put the pipeline in front of routes other than the demo ones.
pub fn wrap<S>(routes: Router<S>, pipeline: OmnibusLayer) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let options = pipeline.options();
    if options.rate_limit.enabled() {
        info!(
            requests_per_window = options.rate_limit.requests_per_window,
            window_ms = options.rate_limit.window.as_millis() as u64,
            max_keys = options.rate_limit.max_keys,
            "Rate limiting enabled"
        );
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_REQUESTS=0)");
    }
    info!(
        timeout_ms = options.timeout.as_millis() as u64,
        namespace = %options.namespace,
        "Request pipeline configured"
    );

    routes.fallback(not_handled).layer(pipeline)
}

fn demo_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/fail", get(handlers::fail))
        .route("/bad-request/{*path}", get(handlers::bad_request))
        .route("/slow", get(handlers::slow))
        .route("/context", get(handlers::context))
}
