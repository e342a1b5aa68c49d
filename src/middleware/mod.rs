//! Request pipeline middleware.
//!
//! The pipeline is a single tower layer, [`OmnibusLayer`], composed from
//! independent parts:
//!
//! - **Rate Limiting**: fixed-window budget per client key over a bounded LRU store
//! - **Deadline**: handler raced against a timer, aborted when it loses
//! - **Request ID**: correlation id propagation and request-bound spans
//! - **Normalization**: every failure mapped to one canonical JSON error
//! - **Client Keys**: socket address by default, trusted-proxy aware
//!
//! # Architecture
//!
//! ```text
//! Request → Identify → Rate Check → Deadline(Handler) → Normalize → Finalize → Response
//!              ↓            ↓              ↓                ↓            ↓
//!        X-Request-Id   429 Too Many   408 Timeout    404 / 500   X-Response-Time
//! ```
//!
//! # Security Considerations
//!
//! - 5xx bodies never contain internal error messages
//! - Logs never contain request or response header maps
//! - Forwarding headers are honored only from trusted proxy networks
//! - The counter store is bounded, so unique client keys cannot exhaust memory

pub mod ip;
pub mod normalize;
pub mod omnibus;
pub mod rate_limit;
pub mod request_id;
pub mod timeout;

pub use ip::{CidrRange, HeaderKey, KeyExtractor, PeerAddress, TrustedProxyConfig, UNKNOWN_IP};
pub use normalize::{ErrorRenderer, JsonErrorRenderer, NotHandled, normalize, not_handled};
pub use omnibus::{OmnibusLayer, OmnibusService};
pub use rate_limit::{Admission, RateDecision, RateLimitError, RateLimiter, Unlimited};
pub use request_id::{CorrelationId, RequestIdExt, SpanTracer, TraceContext, TraceFields, Tracer};
pub use timeout::Deadline;
