//! Per-client admission control over a fixed counting window.
//!
//! # Algorithm
//!
//! Each client key owns a [`Bucket`](crate::store::Bucket) in the bounded
//! [`CounterStore`]. Every request increments the bucket; the request is
//! admitted while the post-increment count is at most `requests_per_window`.
//! The request that brings the count exactly to the limit is still admitted,
//! the next one is rejected.
//!
//! - Fixed windows opened on the first request of a client
//! - Bounded memory: least recently seen clients are evicted at capacity
//! - Thread-safe: increments are atomic per store
//!
//! # Response Headers
//!
//! Attached to every response, admitted or not, while a limit is enforced:
//! - `X-RateLimit-Limit`: Configured requests per window
//! - `X-RateLimit-Remaining`: Requests left in the current window
//! - `X-RateLimit-Reset`: RFC 3339 timestamp at which the window closes
//!
//! On rate limit exceeded (429) the error additionally carries:
//! - `Retry-After`: Whole seconds until the window closes

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitOptions;
use crate::store::CounterStore;

/// `X-RateLimit-Limit` header name.
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");

/// `X-RateLimit-Remaining` header name.
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// `X-RateLimit-Reset` header name.
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Error type for rate limiter configuration.
///
/// This is a simple enum with no data, so it derives `Copy` for efficient
/// pass-by-value semantics without cloning overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Window length cannot be zero.
    ZeroWindow,
    /// The store must be able to track at least one client.
    ZeroCapacity,
    /// Window length does not fit the timestamp range.
    WindowTooLarge,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroWindow => write!(f, "rate limit window must be greater than 0"),
            RateLimitError::ZeroCapacity => {
                write!(f, "rate limit key capacity must be greater than 0")
            }
            RateLimitError::WindowTooLarge => write!(f, "rate limit window is too large"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Outcome of evaluating one request against the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Present only when the request was rejected.
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    /// Headers describing the client's budget, attached to every response.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.limit));
        headers.insert(
            X_RATELIMIT_REMAINING.clone(),
            HeaderValue::from(self.remaining),
        );
        let reset = self.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(value) = HeaderValue::from_str(&reset) {
            headers.insert(X_RATELIMIT_RESET.clone(), value);
        }
        headers
    }
}

/// Admission policy consulted once per request before the handler runs.
pub trait Admission: Send + Sync + fmt::Debug {
    /// Count one request for `client_key` and decide whether it may proceed.
    fn evaluate(&self, client_key: &str) -> RateDecision;

    /// Whether decisions describe a real budget worth advertising in headers.
    fn is_enforcing(&self) -> bool {
        true
    }

    /// Number of clients currently tracked, for metrics.
    fn tracked_clients(&self) -> usize {
        0
    }
}

/// Fixed-window limiter over a bounded [`CounterStore`].
///
/// # Example
///
/// ```rust,ignore
/// let limiter = RateLimiter::new(&RateLimitOptions {
///     window: Duration::from_secs(60),
///     max_keys: 10_000,
///     requests_per_window: 60,
/// })?;
/// let decision = limiter.evaluate("203.0.113.50");
/// assert!(decision.allowed);
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    store: CounterStore,
    limit: u64,
}

impl RateLimiter {
    /// Create a limiter using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` if the window or key capacity is zero, or if
    /// the window reaches past the representable timestamp range.
    pub fn new(options: &RateLimitOptions) -> Result<Self, RateLimitError> {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Create a limiter driven by the given clock.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError` if the window or key capacity is zero, or if
    /// the window reaches past the representable timestamp range.
    pub fn with_clock(
        options: &RateLimitOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        if options.window.is_zero() {
            return Err(RateLimitError::ZeroWindow);
        }
        let capacity = NonZeroUsize::new(options.max_keys).ok_or(RateLimitError::ZeroCapacity)?;
        let window = chrono::Duration::from_std(options.window)
            .map_err(|_| RateLimitError::WindowTooLarge)?;
        if clock.now().checked_add_signed(window).is_none() {
            return Err(RateLimitError::WindowTooLarge);
        }

        Ok(Self {
            store: CounterStore::with_clock(capacity, window, clock),
            limit: options.requests_per_window,
        })
    }

    /// Configured requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Underlying counter store.
    pub fn store(&self) -> &CounterStore {
        &self.store
    }
}

impl Admission for RateLimiter {
    fn evaluate(&self, client_key: &str) -> RateDecision {
        let bucket = self.store.touch(client_key);
        let allowed = bucket.count <= self.limit;
        let retry_after_secs = if allowed {
            None
        } else {
            let wait = bucket.reset_at - self.store.now();
            let wait = wait.to_std().unwrap_or(Duration::ZERO);
            Some(ceil_secs(wait).max(1))
        };

        if !allowed {
            debug!(
                client = %client_key,
                count = bucket.count,
                limit = self.limit,
                "Client exceeded its window budget"
            );
        }

        RateDecision {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(bucket.count),
            reset_at: bucket.reset_at,
            retry_after_secs,
        }
    }

    fn tracked_clients(&self) -> usize {
        self.store.len()
    }
}

/// Admission policy that admits everything.
///
/// Used when rate limiting is disabled. Its decisions carry no meaningful
/// budget, so no rate limit headers are advertised.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Admission for Unlimited {
    fn evaluate(&self, _client_key: &str) -> RateDecision {
        RateDecision {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: Utc::now(),
            retry_after_secs: None,
        }
    }

    fn is_enforcing(&self) -> bool {
        false
    }
}

/// Round a duration up to whole seconds.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
