//! The request pipeline: identify, admit, race, normalize, finalize.
//!
//! ```text
//! START → IDENTIFY → RATE_CHECK ─┬─ rejected ──────────────────────────────┐
//!                                └─ admitted → TIMED_EXECUTION ─┬ completed ┤
//!                                                               ├ timed out ┼→ FINALIZE → END
//!                                                               └ failed ───┘
//! ```
//!
//! FINALIZE renders the canonical error (if any), applies the tracking headers
//! (correlation id, rate limit budget, elapsed time), emits exactly one log
//! line in the request span and records metrics. Errors never escape the
//! service: its error type is `Infallible`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let pipeline = OmnibusLayer::new(PipelineOptions::default())?
//!     .with_key_extractor(HeaderKey::new(
//!         HeaderName::from_static("x-api-key"),
//!         PeerAddress::default(),
//!     ));
//!
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .fallback(not_handled)
//!     .layer(pipeline);
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::{Instrument, error, info, warn};

use crate::config::{Config, PipelineOptions};
use crate::error::{AppResult, CanonicalError, ErrorKind, Failure};
use crate::metrics;
use crate::middleware::ip::{KeyExtractor, PeerAddress, TrustedProxyConfig};
use crate::middleware::normalize::{
    ErrorRenderer, JsonErrorRenderer, RequestSummary, ResponseSummary, normalize, take_thrown,
};
use crate::middleware::rate_limit::{Admission, RateLimiter, Unlimited};
use crate::middleware::request_id::{SpanTracer, TraceContext, TraceFields, Tracer};
use crate::middleware::timeout::Deadline;

/// How a request left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Rejected,
    Completed,
    TimedOut,
    Failed,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Rejected => "rejected",
            Outcome::Completed => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::Failed => "failed",
        }
    }
}

/// Strategies and options shared by every request.
#[derive(Debug, Clone)]
struct Pipeline {
    options: Arc<PipelineOptions>,
    admission: Arc<dyn Admission>,
    tracer: Arc<dyn Tracer>,
    renderer: Arc<dyn ErrorRenderer>,
    keys: Arc<dyn KeyExtractor>,
    deadline: Deadline,
}

/// Tower layer installing the pipeline around a service.
///
/// Strategies default to a [`RateLimiter`] (or [`Unlimited`] when
/// `requests_per_window` is 0), [`SpanTracer`], [`JsonErrorRenderer`] and
/// [`PeerAddress`]; each can be replaced with a `with_*` method.
#[derive(Debug, Clone)]
pub struct OmnibusLayer {
    pipeline: Pipeline,
}

impl OmnibusLayer {
    /// Create a pipeline from validated options.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if the options are invalid.
    pub fn new(options: PipelineOptions) -> AppResult<Self> {
        options.validate()?;

        let admission: Arc<dyn Admission> = if options.rate_limit.enabled() {
            Arc::new(RateLimiter::new(&options.rate_limit)?)
        } else {
            Arc::new(Unlimited)
        };
        let deadline = Deadline::new(options.timeout);

        Ok(Self {
            pipeline: Pipeline {
                options: Arc::new(options),
                admission,
                tracer: Arc::new(SpanTracer::default()),
                renderer: Arc::new(JsonErrorRenderer),
                keys: Arc::new(PeerAddress::default()),
                deadline,
            },
        })
    }

    /// Create a pipeline from application configuration.
    ///
    /// Uses the configured logger name and trusted proxies.
    ///
    /// # Errors
    ///
    /// Returns `AppError` if the pipeline options are invalid.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let trusted = TrustedProxyConfig::new(&config.trusted_proxies);
        Ok(Self::new(config.pipeline.clone())?
            .with_tracer(SpanTracer::new(config.log_name.clone()))
            .with_key_extractor(PeerAddress::new(trusted)))
    }

    pub fn with_admission(mut self, admission: impl Admission + 'static) -> Self {
        self.pipeline.admission = Arc::new(admission);
        self
    }

    pub fn with_tracer(mut self, tracer: impl Tracer + 'static) -> Self {
        self.pipeline.tracer = Arc::new(tracer);
        self
    }

    pub fn with_renderer(mut self, renderer: impl ErrorRenderer + 'static) -> Self {
        self.pipeline.renderer = Arc::new(renderer);
        self
    }

    pub fn with_key_extractor(mut self, keys: impl KeyExtractor + 'static) -> Self {
        self.pipeline.keys = Arc::new(keys);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.pipeline.options
    }

    /// The deadline shared by every service this layer produces.
    pub fn deadline(&self) -> &Deadline {
        &self.pipeline.deadline
    }
}

impl<S> Layer<S> for OmnibusLayer {
    type Service = OmnibusService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OmnibusService {
            inner,
            pipeline: Arc::new(self.pipeline.clone()),
        }
    }
}

/// Pipeline service wrapper.
#[derive(Debug, Clone)]
pub struct OmnibusService<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S> Service<Request<Body>> for OmnibusService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<anyhow::Error>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The inner clone is driven to readiness inside the timed execution.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let inner = self.inner.clone();

        Box::pin(async move { Ok(pipeline.handle(inner, req).await) })
    }
}

impl Pipeline {
    async fn handle<S>(&self, mut inner: S, mut req: Request<Body>) -> Response<Body>
    where
        S: Service<Request<Body>, Response = Response<Body>> + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<anyhow::Error>,
    {
        let options = &self.options;

        // IDENTIFY
        let correlation = self.tracer.identify(&req, &options.headers.tracking);
        let correlation_id = correlation.as_str();
        let client = self.keys.extract(&req).into_owned();
        let trace = TraceContext::new(correlation_id.to_string());
        let started_at = trace.started_at;
        req.extensions_mut().insert(trace);

        let summary = RequestSummary::from_request(&req, &client, correlation_id);
        let span = self.tracer.bind_logger(&TraceFields {
            correlation_id,
            client: &client,
            method: &summary.method,
            path: &summary.path,
            namespace: &options.namespace,
        });

        let mut tracking = HeaderMap::new();
        if let Some(value) = correlation.header_value() {
            tracking.insert(options.headers.tracking.clone(), value);
        }

        // RATE_CHECK
        let decision = self.admission.evaluate(&client);
        if self.admission.is_enforcing() {
            for (name, value) in &decision.headers() {
                tracking.insert(name.clone(), value.clone());
            }
        }
        metrics::set_tracked_clients(self.admission.tracked_clients());

        let (mut outcome, response, thrown) = if !decision.allowed {
            metrics::record_rate_limited();
            let rejection = CanonicalError::rate_limited(&decision);
            (Outcome::Rejected, None, Some(Failure::Canonical(rejection)))
        } else {
            // TIMED_EXECUTION
            let call = async move {
                std::future::poll_fn(|cx| inner.poll_ready(cx))
                    .await
                    .map_err(|e| Failure::Unhandled(e.into()))?;
                inner
                    .call(req)
                    .await
                    .map_err(|e| Failure::Unhandled(e.into()))
            }
            .instrument(span.clone());

            match self.deadline.run(call).await {
                Ok(mut response) => {
                    let thrown = take_thrown(&mut response);
                    (Outcome::Completed, Some(response), thrown)
                }
                Err(failure) => {
                    let outcome = match &failure {
                        Failure::Canonical(e) if e.kind() == ErrorKind::DeadlineExceeded => {
                            Outcome::TimedOut
                        }
                        _ => Outcome::Failed,
                    };
                    (outcome, None, Some(failure))
                }
            }
        };

        // FINALIZE
        let error = normalize(&summary, response.as_ref(), thrown);
        if outcome == Outcome::Completed && error.is_some() {
            outcome = Outcome::Failed;
        }

        let mut response = match (error.as_ref(), response) {
            (Some(error), _) => self.renderer.render(error),
            (None, Some(response)) => response,
            (None, None) => self.renderer.render(&CanonicalError::route_not_found(
                &summary.method,
                &summary.path,
            )),
        };

        let elapsed = started_at.elapsed();
        if let Ok(value) = HeaderValue::from_str(&format_elapsed(elapsed)) {
            tracking.insert(options.headers.timing.clone(), value);
        }
        let headers = response.headers_mut();
        for (name, value) in &tracking {
            headers.insert(name.clone(), value.clone());
        }

        let logged = ResponseSummary {
            status: response.status().as_u16(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
        };
        span.in_scope(|| log_outcome(outcome, &logged, error.as_ref()));
        record_outcome(outcome, &logged, elapsed);

        response
    }
}

/// Elapsed time as written to the timing header, e.g. `12.345ms`.
fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.3}ms", elapsed.as_secs_f64() * 1000.0)
}

fn log_outcome(outcome: Outcome, response: &ResponseSummary, error: Option<&CanonicalError>) {
    let Some(error) = error else {
        info!(
            status = response.status,
            duration_ms = response.duration_ms,
            outcome = outcome.as_str(),
            "Request completed"
        );
        return;
    };

    if error.status().is_server_error() {
        error!(
            status = response.status,
            duration_ms = response.duration_ms,
            outcome = outcome.as_str(),
            kind = error.kind().as_str(),
            error = %error,
            "Request failed"
        );
    } else {
        warn!(
            status = response.status,
            duration_ms = response.duration_ms,
            outcome = outcome.as_str(),
            kind = error.kind().as_str(),
            message = %error.payload().message,
            "Request rejected"
        );
    }
}

fn record_outcome(outcome: Outcome, response: &ResponseSummary, elapsed: Duration) {
    metrics::record_request(outcome.as_str(), response.status);
    metrics::record_request_duration(outcome.as_str(), elapsed.as_secs_f64());
    if outcome == Outcome::TimedOut {
        metrics::record_timeout();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RateLimitOptions;
    use crate::middleware::rate_limit::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
    use crate::middleware::request_id::CorrelationId;
    use axum::http::StatusCode;
    use axum::http::header::{CONNECTION, RETRY_AFTER};
    use tower::ServiceExt;

    fn options(requests: u64, timeout_ms: u64) -> PipelineOptions {
        PipelineOptions {
            rate_limit: RateLimitOptions {
                window: Duration::from_secs(60),
                max_keys: 100,
                requests_per_window: requests,
            },
            timeout: Duration::from_millis(timeout_ms),
            ..PipelineOptions::default()
        }
    }

    async fn ok_handler(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(Response::new(Body::from("ok")))
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_micros(12_345)), "12.345ms");
        assert_eq!(format_elapsed(Duration::ZERO), "0.000ms");
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(OmnibusLayer::new(options(10, 0)).is_err());
    }

    #[test]
    fn test_window_past_timestamp_range_rejected() {
        let mut options = options(10, 1_000);
        options.rate_limit.window = Duration::from_millis(10_000_000_000_000_000);

        assert!(OmnibusLayer::new(options).is_err());
    }

    #[tokio::test]
    async fn test_non_utf8_tracking_header_is_echoed_verbatim() {
        let inbound = HeaderValue::from_bytes(b"trace-\xff\xfe").unwrap();
        let service = OmnibusLayer::new(options(10, 1_000))
            .unwrap()
            .layer(tower::service_fn(ok_handler));

        let response = service
            .oneshot(
                Request::builder()
                    .header("x-request-id", inbound.clone())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-request-id").unwrap(), inbound);
    }

    #[tokio::test]
    async fn test_completed_request_gets_tracking_headers() {
        let service = OmnibusLayer::new(options(10, 1_000))
            .unwrap()
            .layer(tower::service_fn(ok_handler));

        let response = service
            .oneshot(
                Request::builder()
                    .header("x-request-id", "req-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-1");
        assert_eq!(response.headers().get(&X_RATELIMIT_LIMIT).unwrap(), "10");
        assert_eq!(response.headers().get(&X_RATELIMIT_REMAINING).unwrap(), "9");
        let timing = response.headers().get("x-response-time").unwrap();
        assert!(timing.to_str().unwrap().ends_with("ms"));
    }

    #[tokio::test]
    async fn test_rejected_request_never_reaches_handler() {
        let layer = OmnibusLayer::new(options(1, 1_000)).unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let service = layer.layer(tower::service_fn(move |_req: Request<Body>| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new(Body::empty())) }
        }));

        let first = service.clone().oneshot(Request::new(Body::empty())).await.unwrap();
        let second = service.oneshot(Request::new(Body::empty())).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(RETRY_AFTER));
        assert!(second.headers().contains_key("x-request-id"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let layer = OmnibusLayer::new(options(10, 50)).unwrap();
        let deadline = layer.deadline().clone();
        let service = layer.layer(tower::service_fn(|_req: Request<Body>| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));

        let response = service.oneshot(Request::new(Body::empty())).await.unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
        assert!(response.headers().contains_key("x-response-time"));
        assert_eq!(deadline.armed_timers(), 0);
    }

    #[tokio::test]
    async fn test_service_error_becomes_500() {
        let layer = OmnibusLayer::new(options(10, 1_000)).unwrap();
        let service = layer.layer(tower::service_fn(|_req: Request<Body>| async {
            Err::<Response<Body>, _>(std::io::Error::other("socket exploded"))
        }));

        let response = service.oneshot(Request::new(Body::empty())).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unlimited_pipeline_omits_rate_limit_headers() {
        let service = OmnibusLayer::new(options(0, 1_000))
            .unwrap()
            .layer(tower::service_fn(ok_handler));

        let response = service.oneshot(Request::new(Body::empty())).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(&X_RATELIMIT_LIMIT));
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[derive(Debug)]
    struct FixedTracer;

    impl Tracer for FixedTracer {
        fn identify(
            &self,
            _req: &Request<Body>,
            _header: &axum::http::HeaderName,
        ) -> CorrelationId {
            CorrelationId::from("fixed".to_string())
        }

        fn bind_logger(&self, _fields: &TraceFields<'_>) -> tracing::Span {
            tracing::Span::none()
        }
    }

    #[tokio::test]
    async fn test_custom_tracer_is_used() {
        let service = OmnibusLayer::new(options(10, 1_000))
            .unwrap()
            .with_tracer(FixedTracer)
            .layer(tower::service_fn(ok_handler));

        let response = service
            .oneshot(
                Request::builder()
                    .header("x-request-id", "ignored")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get("x-request-id").unwrap(), "fixed");
    }
}
