use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{CONNECTION, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::normalize::{ErrorRenderer, JsonErrorRenderer};
use crate::middleware::rate_limit::{RateDecision, RateLimitError};

/// Errors raised while configuring or starting the service.
///
/// Request-time failures never use this type; they are represented by
/// [`CanonicalError`] and rendered into a response.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rate limiter configuration error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

/// Failure taxonomy carried by every [`CanonicalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Client exceeded its request budget for the current window (429).
    RateLimitExceeded,
    /// Downstream handler did not settle before the deadline (408).
    DeadlineExceeded,
    /// Unlabeled failure; detail is kept for logs only (500).
    UnhandledFailure,
    /// Nothing downstream produced a response (404).
    RouteNotFound,
    /// Explicit HTTP error raised by a handler.
    Labeled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::UnhandledFailure => "unhandled_failure",
            ErrorKind::RouteNotFound => "route_not_found",
            ErrorKind::Labeled => "labeled",
        }
    }
}

/// Response body for every rendered error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub status_code: u16,
    pub error: String,
    pub message: String,
}

/// Request details attached to an error for diagnostics.
///
/// Only method, path and correlation id are kept; headers never are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub method: String,
    pub path: String,
    pub correlation_id: String,
}

/// Message returned to clients in place of any 5xx detail.
pub const GENERIC_SERVER_MESSAGE: &str = "An internal server error occurred";

/// The single normalized error representation rendered into responses.
///
/// Values are immutable: the `with_*` methods consume the error and return a
/// new one. The original failure, if any, lives in [`cause`](Self::cause) and
/// only ever reaches logs.
///
/// Any `std::error::Error + Send + Sync` converts into an unhandled 500 via
/// `?`. The type itself does not implement `std::error::Error`.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler() -> Result<String, CanonicalError> {
///     let body = tokio::fs::read_to_string("motd.txt").await?; // 500 on failure
///     if body.is_empty() {
///         return Err(CanonicalError::not_found("No message of the day"));
///     }
///     Ok(body)
/// }
/// ```
#[derive(Clone)]
pub struct CanonicalError {
    kind: ErrorKind,
    status: StatusCode,
    headers: HeaderMap,
    payload: ErrorPayload,
    cause: Option<Arc<anyhow::Error>>,
    context: Option<ErrorContext>,
}

impl CanonicalError {
    fn build(kind: ErrorKind, status: StatusCode, message: impl Into<String>) -> Self {
        let title = status.canonical_reason().unwrap_or("Unknown Error");
        let message = if status.is_server_error() {
            GENERIC_SERVER_MESSAGE.to_string()
        } else {
            message.into()
        };
        Self {
            kind,
            status,
            headers: HeaderMap::new(),
            payload: ErrorPayload {
                status_code: status.as_u16(),
                error: title.to_string(),
                message,
            },
            cause: None,
            context: None,
        }
    }

    /// An explicit HTTP error.
    ///
    /// Statuses below 400 are not errors; they are coerced into an unhandled 500.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        if status.as_u16() < 400 {
            let message = message.into();
            return Self::internal(anyhow::anyhow!(
                "error constructed with non-error status {status}: {message}"
            ));
        }
        Self::build(ErrorKind::Labeled, status, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    /// Wrap an arbitrary failure as a 500 with a generic payload.
    pub fn internal(cause: impl Into<anyhow::Error>) -> Self {
        let mut error = Self::build(
            ErrorKind::UnhandledFailure,
            StatusCode::INTERNAL_SERVER_ERROR,
            GENERIC_SERVER_MESSAGE,
        );
        error.cause = Some(Arc::new(cause.into()));
        error
    }

    /// Rejection for a client that exceeded its window budget.
    pub fn rate_limited(decision: &RateDecision) -> Self {
        let message = format!(
            "Exceeded rate limit [{} request(s) per window]",
            decision.limit
        );
        let error = Self::build(
            ErrorKind::RateLimitExceeded,
            StatusCode::TOO_MANY_REQUESTS,
            message,
        );
        match decision.retry_after_secs {
            Some(secs) => error.with_header(RETRY_AFTER, HeaderValue::from(secs)),
            None => error,
        }
    }

    /// Failure reported when the downstream handler loses the deadline race.
    pub fn deadline_exceeded(limit: Duration) -> Self {
        let message = format!(
            "Exceeded time limit [{} millisecond(s)]",
            limit.as_millis()
        );
        Self::build(
            ErrorKind::DeadlineExceeded,
            StatusCode::REQUEST_TIMEOUT,
            message,
        )
        .with_header(CONNECTION, HeaderValue::from_static("close"))
    }

    /// Synthesized when nothing downstream produced a response.
    pub fn route_not_found(method: &str, path: &str) -> Self {
        Self::build(
            ErrorKind::RouteNotFound,
            StatusCode::NOT_FOUND,
            format!("No handler for {method} {path}"),
        )
    }

    /// Return a copy with an extra response header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Return a copy annotated with request details for logs.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn payload(&self) -> &ErrorPayload {
        &self.payload
    }

    /// The original failure, never rendered to clients.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        self.cause.as_deref()
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        self.context.as_ref()
    }
}

impl fmt::Debug for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanonicalError")
            .field("kind", &self.kind)
            .field("status", &self.status.as_u16())
            .field("message", &self.payload.message)
            .field("cause", &self.cause.as_ref().map(|c| format!("{c:#}")))
            .field("context", &self.context)
            .finish()
    }
}

impl fmt::Display for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.payload.error)?;
        match &self.cause {
            Some(cause) => write!(f, ": {cause:#}"),
            None => write!(f, ": {}", self.payload.message),
        }
    }
}

impl<E> From<E> for CanonicalError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::internal(error)
    }
}

/// Renders the error and stashes a copy in the response extensions, so the
/// pipeline can log the cause and re-render with tracking headers.
impl IntoResponse for CanonicalError {
    fn into_response(self) -> Response {
        let mut response = JsonErrorRenderer.render(&self);
        response.extensions_mut().insert(self);
        response
    }
}

/// What the downstream handler produced instead of a response.
#[derive(Debug)]
pub enum Failure {
    /// An error already in canonical form (labeled, timeout, rejection).
    Canonical(CanonicalError),
    /// Anything else: a service error or a panicked handler task.
    Unhandled(anyhow::Error),
}

impl From<CanonicalError> for Failure {
    fn from(error: CanonicalError) -> Self {
        Failure::Canonical(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Canonical(error) => write!(f, "{error}"),
            Failure::Unhandled(cause) => write!(f, "{cause:#}"),
        }
    }
}
