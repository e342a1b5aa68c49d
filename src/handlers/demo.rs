//! Demonstration endpoints, one per pipeline outcome.
//!
//! | Route                   | Outcome                                  |
//! |-------------------------|------------------------------------------|
//! | `GET /`                 | 200 `OK`                                 |
//! | `GET /fail`             | 500 with the generic message             |
//! | `GET /bad-request/*`    | 400 naming the path                      |
//! | `GET /slow?ms=N`        | sleeps `N` ms, 408 past the deadline     |
//! | `GET /context`          | echoes the correlation id                |
//!
//! Unknown paths fall through to the `NotHandled` fallback (404).

use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CanonicalError;
use crate::middleware::TraceContext;
use crate::state::AppState;

/// Plain success.
pub async fn root() -> &'static str {
    "OK"
}

/// Fails with an unlabeled error; the detail only reaches the logs.
pub async fn fail() -> Result<&'static str, CanonicalError> {
    let upstream: Result<&'static str, std::io::Error> = Err(std::io::Error::other(
        "simulated downstream failure: upstream refused connection",
    ));
    Ok(upstream?)
}

/// Fails with a labeled 400.
pub async fn bad_request(Path(path): Path<String>) -> Result<&'static str, CanonicalError> {
    Err(CanonicalError::bad_request(format!(
        "Invalid request path: /{path}"
    )))
}

#[derive(Debug, Deserialize)]
pub struct SlowParams {
    /// Milliseconds to sleep; defaults to twice the pipeline timeout.
    pub ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SlowResponse {
    pub slept_ms: u64,
}

/// Sleeps before answering, to exercise the deadline.
pub async fn slow(
    State(state): State<AppState>,
    Query(params): Query<SlowParams>,
) -> Json<SlowResponse> {
    let default_ms: u64 = state
        .config
        .pipeline
        .timeout
        .as_millis()
        .saturating_mul(2)
        .try_into()
        .unwrap_or(u64::MAX);
    let ms = params.ms.unwrap_or(default_ms);

    debug!(ms, "Sleeping");
    tokio::time::sleep(Duration::from_millis(ms)).await;

    Json(SlowResponse { slept_ms: ms })
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
    pub correlation_id: String,
    pub elapsed_ms: f64,
}

/// Echoes the request's trace context.
pub async fn context(Extension(trace): Extension<TraceContext>) -> Json<ContextResponse> {
    Json(ContextResponse {
        correlation_id: trace.correlation_id,
        elapsed_ms: trace.started_at.elapsed().as_secs_f64() * 1000.0,
    })
}
