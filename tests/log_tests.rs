//! Log output of the request pipeline.
//!
//! Each test installs a thread-local `fmt` subscriber writing into a buffer and
//! inspects the lines the pipeline emitted at `INFO` and above.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderName, Request, Response, StatusCode};
use axum::routing::get;
use omnibus::config::{PipelineOptions, RateLimitOptions};
use omnibus::error::CanonicalError;
use omnibus::middleware::{HeaderKey, OmnibusLayer, PeerAddress};
use omnibus::routes::wrap;
use omnibus::{AppState, Config, build_router};
use parking_lot::Mutex;
use tower::ServiceExt;
use tracing::Level;
use tracing::subscriber::DefaultGuard;

// =============================================================================
// Helpers
// =============================================================================

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

fn options(requests: u64) -> PipelineOptions {
    PipelineOptions {
        rate_limit: RateLimitOptions {
            window: Duration::from_secs(60),
            max_keys: 100,
            requests_per_window: requests,
        },
        timeout: Duration::from_secs(5),
        ..PipelineOptions::default()
    }
}

async fn ok() -> &'static str {
    "OK"
}

async fn labeled() -> Result<&'static str, CanonicalError> {
    Err(CanonicalError::bad_request("name must not be empty"))
}

async fn leaky() -> Result<&'static str, CanonicalError> {
    Err(CanonicalError::internal(anyhow::anyhow!(
        "password authentication failed for user admin/hunter2"
    )))
}

fn app(pipeline: OmnibusLayer) -> Router {
    let routes = Router::new()
        .route("/", get(ok))
        .route("/labeled", get(labeled))
        .route("/leaky", get(leaky));
    wrap(routes, pipeline)
}

fn request(uri: &str, client: &str) -> Request<Body> {
    let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let addr: SocketAddr = client.parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
    app.clone().oneshot(req).await.unwrap()
}

// =============================================================================
// One Line per Request
// =============================================================================

#[tokio::test]
async fn test_completed_request_logs_one_info_line() {
    let (logs, _guard) = capture();
    let app = app(OmnibusLayer::new(options(10)).unwrap());
    let mut req = request("/", "198.51.100.1:4000");
    req.headers_mut()
        .insert("x-request-id", "req-7".parse().unwrap());

    let response = send(&app, req).await;

    assert_eq!(response.status(), StatusCode::OK);
    let lines = logs.lines();
    assert_eq!(lines.len(), 1, "{lines:#?}");
    let line = &lines[0];
    assert!(line.contains(" INFO "), "{line}");
    assert!(line.contains("Request completed"));
    assert!(line.contains("status=200"));
    assert!(line.contains("correlation_id=req-7"));
    assert!(line.contains("client=198.51.100.1"));
}

#[tokio::test]
async fn test_client_error_logs_one_warn_line() {
    let (logs, _guard) = capture();
    let app = app(OmnibusLayer::new(options(10)).unwrap());

    let response = send(&app, request("/labeled", "198.51.100.2:4000")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let lines = logs.lines();
    assert_eq!(lines.len(), 1, "{lines:#?}");
    assert!(lines[0].contains(" WARN "), "{}", lines[0]);
    assert!(lines[0].contains("name must not be empty"));
}

#[tokio::test]
async fn test_rate_limited_request_logs_one_warn_line() {
    let (logs, _guard) = capture();
    let app = app(OmnibusLayer::new(options(1)).unwrap());

    send(&app, request("/", "198.51.100.3:4000")).await;
    let rejected = send(&app, request("/", "198.51.100.3:4000")).await;

    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    let lines = logs.lines();
    assert_eq!(lines.len(), 2, "{lines:#?}");
    assert!(lines[0].contains(" INFO "));
    assert!(lines[1].contains(" WARN "));
    assert!(lines[1].contains("status=429"));
}

#[tokio::test]
async fn test_server_error_logs_cause_at_error_level() {
    let (logs, _guard) = capture();
    let app = app(OmnibusLayer::new(options(10)).unwrap());

    let response = send(&app, request("/leaky", "198.51.100.4:4000")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let lines = logs.lines();
    assert_eq!(lines.len(), 1, "{lines:#?}");
    assert!(lines[0].contains(" ERROR "), "{}", lines[0]);
    assert!(lines[0].contains("hunter2"));
}

#[tokio::test]
async fn test_demo_failure_cause_reaches_the_log() {
    let (logs, _guard) = capture();
    let app = build_router(AppState::new(Config::default())).unwrap();

    let response = send(&app, request("/fail", "198.51.100.5:4000")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let lines = logs.lines();
    let failed: Vec<_> = lines.iter().filter(|l| l.contains(" ERROR ")).collect();
    assert_eq!(failed.len(), 1, "{lines:#?}");
    assert!(failed[0].contains("upstream refused connection"));
}

// =============================================================================
// Redaction
// =============================================================================

#[tokio::test]
async fn test_headers_and_query_never_reach_the_log() {
    let (logs, _guard) = capture();
    let app = app(OmnibusLayer::new(options(10)).unwrap());
    let mut req = request("/leaky?token=s3cr3t-query", "198.51.100.6:4000");
    req.headers_mut()
        .insert("authorization", "Bearer s3cr3t-token".parse().unwrap());
    req.headers_mut()
        .insert("cookie", "session=s3cr3t-cookie".parse().unwrap());

    send(&app, req).await;

    let lines = logs.lines();
    assert!(!lines.is_empty());
    for line in &lines {
        assert!(!line.contains("s3cr3t"), "{line}");
        assert!(!line.contains("cookie"), "{line}");
        assert!(!line.contains("token="), "{line}");
    }
}

#[tokio::test]
async fn test_header_client_key_is_logged_as_digest() {
    let (logs, _guard) = capture();
    let pipeline = OmnibusLayer::new(options(1)).unwrap().with_key_extractor(HeaderKey::new(
        HeaderName::from_static("authorization"),
        PeerAddress::default(),
    ));
    let app = app(pipeline);

    let mut first = request("/", "198.51.100.7:4000");
    first
        .headers_mut()
        .insert("authorization", "Bearer s3cr3t-token".parse().unwrap());
    let mut second = request("/", "198.51.100.8:4000");
    second
        .headers_mut()
        .insert("authorization", "Bearer s3cr3t-token".parse().unwrap());

    assert_eq!(send(&app, first).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, second).await.status(),
        StatusCode::TOO_MANY_REQUESTS,
        "same credential shares one budget across addresses"
    );

    let lines = logs.lines();
    assert_eq!(lines.len(), 2, "{lines:#?}");
    for line in &lines {
        assert!(line.contains("client=authorization:sha256:"), "{line}");
        assert!(!line.contains("s3cr3t"), "{line}");
        assert!(!line.contains("Bearer"), "{line}");
    }
}
