//! Correlation ids and request-bound loggers.
//!
//! # Features
//!
//! - Reuses an inbound tracking header (default `X-Request-Id`) verbatim, byte
//!   for byte, even when it is not valid UTF-8
//! - Generates a UUIDv4 correlation id when the header is missing or empty
//! - Binds a tracing span carrying the correlation id, client, method, path
//!   and namespace; every event emitted inside it inherits those fields
//! - Exposes the id to handlers through the [`TraceContext`] extension
//!
//! # Client Usage
//!
//! Clients can provide their own correlation id:
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8080/context
//! ```
//!
//! The same id is returned in the response for correlation.

use std::fmt;
use std::time::Instant;

use axum::http::{HeaderName, HeaderValue, Request};
use tracing::{Span, info_span};
use uuid::Uuid;

/// Per-request identity stored in request extensions.
///
/// Handlers can extract it with `Extension<TraceContext>`.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub correlation_id: String,
    pub started_at: Instant,
}

impl TraceContext {
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            started_at: Instant::now(),
        }
    }
}

/// Correlation id of one request.
///
/// An inbound id keeps its original header bytes for the response; logs and
/// error context use a lossy UTF-8 rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId {
    text: String,
    inbound: Option<HeaderValue>,
}

impl CorrelationId {
    /// A fresh UUIDv4 id.
    pub fn generate() -> Self {
        Self::from(Uuid::new_v4().to_string())
    }

    /// Reuse an id received in a request header.
    pub fn inbound(value: HeaderValue) -> Self {
        Self {
            text: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            inbound: Some(value),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Value written to the response's tracking header.
    ///
    /// `None` only for a programmatic id that is not a valid header value.
    pub fn header_value(&self) -> Option<HeaderValue> {
        match &self.inbound {
            Some(value) => Some(value.clone()),
            None => HeaderValue::from_str(&self.text).ok(),
        }
    }
}

impl From<String> for CorrelationId {
    fn from(text: String) -> Self {
        Self {
            text,
            inbound: None,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Fields bound to a request's logger.
#[derive(Debug, Clone, Copy)]
pub struct TraceFields<'a> {
    pub correlation_id: &'a str,
    pub client: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub namespace: &'a str,
}

/// Strategy producing correlation ids and request-bound loggers.
pub trait Tracer: Send + Sync + fmt::Debug {
    /// Correlation id for `req`, read from `header` when present.
    fn identify(&self, req: &Request<axum::body::Body>, header: &HeaderName) -> CorrelationId {
        identify(req, header)
    }

    /// Span every log line of the request is emitted in.
    fn bind_logger(&self, fields: &TraceFields<'_>) -> Span;
}

/// Default tracer: header reuse or UUIDv4, and an `info` level span.
#[derive(Debug, Clone)]
pub struct SpanTracer {
    logger: String,
}

impl SpanTracer {
    /// Create a tracer whose spans carry `logger` as their logger name.
    pub fn new(logger: impl Into<String>) -> Self {
        Self {
            logger: logger.into(),
        }
    }
}

impl Default for SpanTracer {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

impl Tracer for SpanTracer {
    fn bind_logger(&self, fields: &TraceFields<'_>) -> Span {
        info_span!(
            "request",
            logger = %self.logger,
            correlation_id = %fields.correlation_id,
            client = %fields.client,
            method = %fields.method,
            path = %fields.path,
            namespace = %fields.namespace,
        )
    }
}

/// Extract the correlation id from `header` or generate a new one.
pub fn identify<B>(req: &Request<B>, header: &HeaderName) -> CorrelationId {
    match req.headers().get(header) {
        Some(value) if !value.is_empty() => CorrelationId::inbound(value.clone()),
        _ => CorrelationId::generate(),
    }
}

/// Extension trait to read the correlation id assigned by the pipeline.
pub trait RequestIdExt {
    /// The correlation id, once the pipeline has identified the request.
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions()
            .get::<TraceContext>()
            .map(|ctx| ctx.correlation_id.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    fn tracking() -> HeaderName {
        HeaderName::from_static("x-request-id")
    }

    #[test]
    fn test_identify_reuses_existing_id() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        let id = identify(&req, &tracking());

        assert_eq!(id.as_str(), "existing-id-123");
        assert_eq!(id.header_value().unwrap(), "existing-id-123");
    }

    #[test]
    fn test_identify_echoes_non_utf8_header_bytes() {
        let raw = HeaderValue::from_bytes(b"caf\xe9-42").unwrap();
        let req = Request::builder()
            .header("x-request-id", raw.clone())
            .body(Body::empty())
            .unwrap();

        let id = identify(&req, &tracking());

        assert_eq!(id.header_value().unwrap(), raw);
        assert!(id.as_str().starts_with("caf"));
        assert!(id.as_str().ends_with("-42"));
    }

    #[test]
    fn test_identify_generates_uuid() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = identify(&req, &tracking());

        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_eq!(id.header_value().unwrap(), id.as_str());
    }

    #[test]
    fn test_identify_ignores_empty_header() {
        let req = Request::builder()
            .header("x-request-id", "")
            .body(Body::empty())
            .unwrap();

        let id = identify(&req, &tracking());

        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_identify_honors_custom_header() {
        let req = Request::builder()
            .header("x-request-id", "ignored")
            .header("x-correlation-id", "abc")
            .body(Body::empty())
            .unwrap();

        let id = identify(&req, &HeaderName::from_static("x-correlation-id"));

        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let req = Request::builder().body(Body::empty()).unwrap();

        assert_ne!(identify(&req, &tracking()), identify(&req, &tracking()));
    }

    #[test]
    fn test_request_id_ext_trait() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(TraceContext::new("test-id".to_string()));

        assert_eq!(req.request_id(), Some("test-id"));
    }

    #[test]
    fn test_request_id_ext_trait_none() {
        let req = Request::builder().body(Body::empty()).unwrap();

        assert_eq!(req.request_id(), None);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_span_tracer_binds_fields_to_every_event() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let span = SpanTracer::new("edge").bind_logger(&TraceFields {
            correlation_id: "abc",
            client: "127.0.0.1",
            method: "GET",
            path: "/orders",
            namespace: "state",
        });
        span.in_scope(|| tracing::info!("inside the request"));

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        let line = output.lines().find(|l| l.contains("inside the request")).unwrap();
        assert!(line.contains("logger=edge"));
        assert!(line.contains("correlation_id=abc"));
        assert!(line.contains("client=127.0.0.1"));
        assert!(line.contains("method=GET"));
        assert!(line.contains("path=/orders"));
        assert!(line.contains("namespace=state"));
    }
}
