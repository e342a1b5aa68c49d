//! Failure normalization, rendering and log redaction.
//!
//! Every way a request can fail ends up as exactly one [`CanonicalError`]:
//!
//! | Downstream outcome                          | Result                          |
//! |---------------------------------------------|---------------------------------|
//! | `Failure::Canonical` (labeled, 408, 429)    | passed through with context     |
//! | `Failure::Unhandled` (service error, panic) | 500, generic payload            |
//! | response marked [`NotHandled`]              | 404 naming method and path      |
//! | any other response                          | no error                        |
//!
//! Handlers that return `Err(CanonicalError)` produce a response carrying the
//! error in its extensions; [`take_thrown`] recovers it so it is treated
//! exactly like a thrown failure.
//!
//! Logged summaries hold method, path, client and status only. Header maps and
//! query strings never reach the logs.

use std::fmt;

use axum::Json;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::{CanonicalError, ErrorContext, Failure};

/// Marker response for requests no route claimed.
///
/// Installed as the router fallback; the pipeline turns it into a
/// route-not-found error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotHandled;

impl IntoResponse for NotHandled {
    fn into_response(self) -> Response {
        let mut response = StatusCode::NOT_FOUND.into_response();
        response.extensions_mut().insert(self);
        response
    }
}

/// Router fallback handler producing [`NotHandled`].
pub async fn not_handled() -> NotHandled {
    NotHandled
}

/// What may be logged about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    pub client: String,
    pub correlation_id: String,
}

impl RequestSummary {
    pub fn from_request<B>(req: &Request<B>, client: &str, correlation_id: &str) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            client: client.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }

    /// Error context derived from the summary.
    pub fn context(&self) -> ErrorContext {
        ErrorContext {
            method: self.method.clone(),
            path: self.path.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// What may be logged about a response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseSummary {
    pub status: u16,
    pub duration_ms: f64,
}

/// Remove an error stashed by `CanonicalError::into_response`.
pub fn take_thrown(response: &mut Response) -> Option<Failure> {
    response
        .extensions_mut()
        .remove::<CanonicalError>()
        .map(Failure::Canonical)
}

/// Map the downstream outcome to at most one canonical error.
///
/// A missing response with nothing thrown is treated like [`NotHandled`].
pub fn normalize(
    request: &RequestSummary,
    response: Option<&Response>,
    thrown: Option<Failure>,
) -> Option<CanonicalError> {
    let error = match thrown {
        Some(Failure::Canonical(error)) => error,
        Some(Failure::Unhandled(cause)) => CanonicalError::internal(cause),
        None => match response {
            Some(response) if response.extensions().get::<NotHandled>().is_none() => {
                return None;
            }
            _ => CanonicalError::route_not_found(&request.method, &request.path),
        },
    };

    Some(error.with_context(request.context()))
}

/// Turns a canonical error into a response.
///
/// Tracking headers are applied by the pipeline after rendering.
pub trait ErrorRenderer: Send + Sync + fmt::Debug {
    fn render(&self, error: &CanonicalError) -> Response;
}

/// Renders `{"status_code", "error", "message"}` as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonErrorRenderer;

impl ErrorRenderer for JsonErrorRenderer {
    fn render(&self, error: &CanonicalError) -> Response {
        let mut response = (error.status(), Json(error.payload())).into_response();
        let headers = response.headers_mut();
        for (name, value) in error.headers() {
            headers.insert(name.clone(), value.clone());
        }
        response
    }
}
