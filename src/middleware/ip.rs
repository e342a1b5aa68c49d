//! Client key extraction for rate limiting.
//!
//! The rate limiter counts requests per *client key*. By default the key is
//! the socket address of the connection (`ConnectInfo<SocketAddr>`), which
//! cannot be spoofed by the client. Alternate strategies implement
//! [`KeyExtractor`], e.g. [`HeaderKey`] to limit per API key.
//!
//! # Forwarding Headers
//!
//! Behind a reverse proxy every connection comes from the proxy, so the real
//! client has to be read from `X-Forwarded-For` or `X-Real-IP`. These headers
//! are set by whoever sends the request, so they are honored **only** when the
//! connection itself originates from a configured trusted proxy:
//!
//! ```text
//! peer in TRUSTED_PROXIES?  ── yes ─→  first X-Forwarded-For hop, else X-Real-IP, else peer
//!          │
//!          no ──────────────────────→  peer address
//! ```
//!
//! Configure your proxy to overwrite (not append to) the client IP headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```

use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderName, Request};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Fallback key when no client address can be determined.
///
/// All requests without identifiable addresses share this key. This happens
/// when the server is not started with `into_make_service_with_connect_info`.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is accepted as a single-host range.
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip, prefix) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = ip.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(prefix) => prefix.parse::<u8>().ok()?,
            None => max_prefix,
        };

        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // IPv4 and IPv6 don't match
            _ => false,
        }
    }
}

/// Set of networks whose forwarding headers are trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Create a trusted proxy configuration from CIDR strings.
    ///
    /// Invalid CIDR strings are logged as warnings and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// Whether any trusted networks are configured.
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` belongs to a trusted proxy network.
    ///
    /// With no ranges configured nothing is trusted.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Key Extraction
// =============================================================================

/// Strategy deriving the rate limit key of a request.
pub trait KeyExtractor: Send + Sync + fmt::Debug {
    fn extract(&self, req: &Request<Body>) -> Cow<'static, str>;
}

/// Keys requests by source address, honoring forwarding headers from trusted proxies.
#[derive(Debug, Clone, Default)]
pub struct PeerAddress {
    trusted_proxies: TrustedProxyConfig,
}

impl PeerAddress {
    pub fn new(trusted_proxies: TrustedProxyConfig) -> Self {
        Self { trusted_proxies }
    }
}

impl KeyExtractor for PeerAddress {
    fn extract(&self, req: &Request<Body>) -> Cow<'static, str> {
        let Some(peer) = peer_addr(req) else {
            return Cow::Borrowed(UNKNOWN_IP);
        };

        if self.trusted_proxies.is_trusted(&peer.ip()) {
            if let Some(forwarded) = forwarded_ip(req) {
                debug!(client_ip = %forwarded, proxy = %peer, "Client IP taken from forwarding header");
                return Cow::Owned(forwarded.to_string());
            }
        } else if forwarded_ip(req).is_some() && self.trusted_proxies.is_enabled() {
            debug!(peer = %peer, "Ignoring forwarding header from untrusted peer");
        }

        Cow::Owned(peer.ip().to_string())
    }
}

/// Hex characters of the header digest kept in a key.
const HEADER_DIGEST_LEN: usize = 32;

/// Keys requests by the value of a header, e.g. an API key.
///
/// Requests without the header fall back to [`PeerAddress`]. The value is
/// replaced by a truncated SHA-256 digest, so keys are safe to log and store,
/// and is namespaced by the header name so it can never collide with an
/// address key:
///
/// ```text
/// Authorization: Bearer abc  ─→  authorization:sha256:<32 hex chars>
/// ```
#[derive(Debug, Clone)]
pub struct HeaderKey {
    header: HeaderName,
    fallback: PeerAddress,
}

impl HeaderKey {
    pub fn new(header: HeaderName, fallback: PeerAddress) -> Self {
        Self { header, fallback }
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, req: &Request<Body>) -> Cow<'static, str> {
        match req
            .headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            Some(value) => Cow::Owned(format!("{}:sha256:{}", self.header, digest(value))),
            None => self.fallback.extract(req),
        }
    }
}

fn digest(value: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(value.as_bytes()));
    hex.truncate(HEADER_DIGEST_LEN);
    hex
}

/// Socket address of the connection, when the server exposes it.
fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Client address claimed by forwarding headers.
///
/// `X-Forwarded-For` wins over `X-Real-IP`; only the first hop of
/// `X-Forwarded-For` is used. Values that do not parse as an address are ignored.
fn forwarded_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let headers = req.headers();
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    from_xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request_from(peer: Option<&str>, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
        }
        req
    }

    fn trusting(cidrs: &[&str]) -> PeerAddress {
        let cidrs: Vec<String> = cidrs.iter().map(|c| (*c).to_string()).collect();
        PeerAddress::new(TrustedProxyConfig::new(&cidrs))
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse_ipv4() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();
        assert_eq!(cidr.prefix_len, 8);
    }

    #[test]
    fn test_cidr_parse_ipv6() {
        let cidr = CidrRange::parse("::1/128").unwrap();
        assert_eq!(cidr.prefix_len, 128);
    }

    #[test]
    fn test_cidr_parse_single_ip() {
        let cidr = CidrRange::parse("192.168.1.1").unwrap();
        assert_eq!(cidr.prefix_len, 32);
    }

    #[test]
    fn test_cidr_parse_invalid() {
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/x").is_none());
    }

    #[test]
    fn test_cidr_contains_ipv4() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();

        assert!(cidr.contains(&"10.0.0.1".parse().unwrap()));
        assert!(cidr.contains(&"10.255.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_zero_prefix_matches_everything() {
        let cidr = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(cidr.contains(&"203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_trusted_proxy_config_empty_trusts_nothing() {
        let config = TrustedProxyConfig::new(&[]);
        assert!(!config.is_enabled());
        assert!(!config.is_trusted(&"10.0.0.1".parse().unwrap()));
    }

    // ==========================================================================
    // Key Extraction Tests
    // ==========================================================================

    #[test]
    fn test_peer_address_is_default_key() {
        let req = request_from(Some("203.0.113.7:5123"), &[]);
        assert_eq!(PeerAddress::default().extract(&req), "203.0.113.7");
    }

    #[test]
    fn test_missing_connect_info_falls_back_to_unknown() {
        let req = request_from(None, &[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(PeerAddress::default().extract(&req), UNKNOWN_IP);
    }

    #[test]
    fn test_forwarding_header_ignored_without_trusted_proxies() {
        let req = request_from(Some("203.0.113.7:5123"), &[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(PeerAddress::default().extract(&req), "203.0.113.7");
    }

    #[test]
    fn test_forwarding_header_ignored_from_untrusted_peer() {
        let req = request_from(Some("203.0.113.7:5123"), &[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(trusting(&["10.0.0.0/8"]).extract(&req), "203.0.113.7");
    }

    #[test]
    fn test_first_forwarded_hop_used_from_trusted_peer() {
        let req = request_from(
            Some("10.1.2.3:443"),
            &[("x-forwarded-for", "198.51.100.1, 10.0.0.2")],
        );
        assert_eq!(trusting(&["10.0.0.0/8"]).extract(&req), "198.51.100.1");
    }

    #[test]
    fn test_real_ip_used_when_forwarded_for_absent() {
        let req = request_from(Some("10.1.2.3:443"), &[("x-real-ip", "198.51.100.2")]);
        assert_eq!(trusting(&["10.0.0.0/8"]).extract(&req), "198.51.100.2");
    }

    #[test]
    fn test_garbage_forwarding_header_falls_back_to_peer() {
        let req = request_from(Some("10.1.2.3:443"), &[("x-forwarded-for", "not-an-ip")]);
        assert_eq!(trusting(&["10.0.0.0/8"]).extract(&req), "10.1.2.3");
    }

    #[test]
    fn test_header_key_is_digest_of_header_value() {
        let extractor = HeaderKey::new(HeaderName::from_static("x-api-key"), PeerAddress::default());
        let req = request_from(Some("203.0.113.7:5123"), &[("x-api-key", "tenant-42")]);

        let key = extractor.extract(&req);

        let digest = key.strip_prefix("x-api-key:sha256:").unwrap();
        assert_eq!(digest.len(), HEADER_DIGEST_LEN);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!key.contains("tenant-42"));
    }

    #[test]
    fn test_header_key_is_stable_and_distinguishes_values() {
        let extractor = HeaderKey::new(
            HeaderName::from_static("authorization"),
            PeerAddress::default(),
        );
        let alice = request_from(None, &[("authorization", "Bearer alice")]);
        let alice_again = request_from(Some("10.0.0.9:1"), &[("authorization", "Bearer alice")]);
        let bob = request_from(None, &[("authorization", "Bearer bob")]);

        assert_eq!(extractor.extract(&alice), extractor.extract(&alice_again));
        assert_ne!(extractor.extract(&alice), extractor.extract(&bob));
    }

    #[test]
    fn test_header_key_falls_back_to_peer() {
        let extractor = HeaderKey::new(HeaderName::from_static("x-api-key"), PeerAddress::default());
        let req = request_from(Some("203.0.113.7:5123"), &[]);

        assert_eq!(extractor.extract(&req), "203.0.113.7");
    }

    #[test]
    fn test_ipv6_peer_as_trait_object() {
        let extractor: Box<dyn KeyExtractor> = Box::new(PeerAddress::default());
        let req = request_from(Some("[::1]:8080"), &[]);

        assert_eq!(extractor.extract(&req), "::1");
    }
}
