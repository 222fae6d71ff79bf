//! Client IP extraction and Cloudflare header validation.
//!
//! The extraction stage runs right after the tracer. It resolves the caller's
//! address once, builds the immutable [`RequestContext`] and stores it in the
//! request extensions; every later stage and the forwarder read it from there.
//!
//! # Header Priority
//!
//! Checks in order (returns the first valid address):
//! 1. `CF-Connecting-IP` (Cloudflare)
//! 2. `True-Client-IP` (Cloudflare Enterprise, Akamai)
//! 3. `X-Real-IP` (nginx)
//! 4. `X-Forwarded-For`: the leftmost address that is not private
//! 5. The socket peer address (`ConnectInfo<SocketAddr>`)
//! 6. Falls back to [`UNKNOWN_IP`]
//!
//! Every candidate must parse as an IP address; unparsable values are skipped.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **These headers are client-controlled.** Unless the gateway sits behind a
//! proxy that overwrites them, a client can pick its own rate limit key.
//! Deploy behind a trusted edge, or enable `USE_CLOUDFLARE` so requests that
//! carry Cloudflare headers without arriving from Cloudflare are reported.
//!
//! ## The "unknown" Fallback
//!
//! When nothing yields an address, all such requests share the `"unknown"`
//! key and are rate-limited together.
//!
//! # Internal Architecture
//!
//! ```text
//!   ┌──────────────────────────┐
//!   │  extract_ip_from_request │ ← returns ExtractedIp (Copy, no allocation)
//!   └────────────┬─────────────┘
//!                │
//!                ▼
//!   ┌──────────────────────────┐       ┌────────────────────────────┐
//!   │   IpExtractionService    │ ────▶ │ CloudflareValidationService│
//!   │ - RequestContext         │       │ - peer in Cloudflare CIDRs?│
//!   │ - scope / span client_ip │       │ - logs CloudflareSpoof     │
//!   └──────────────────────────┘       └────────────────────────────┘
//! ```

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::Span;

use crate::context::{RequestContext, RequestId, RequestScope};
use crate::events::{Event, EventKind, SharedLogger};

/// Fallback IP value when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const TRUE_CLIENT_IP: &str = "true-client-ip";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const CF_RAY: &str = "cf-ray";
const CF_VISITOR: &str = "cf-visitor";

/// Private, loopback and link-local networks. Addresses in these ranges are
/// proxies, never the real client, when they appear in `X-Forwarded-For`.
const PRIVATE_CIDRS: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Cloudflare's published IPv4 ranges (https://www.cloudflare.com/ips/).
const CLOUDFLARE_CIDRS: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
    "131.0.72.0/22",
];

static PRIVATE_RANGES: LazyLock<Vec<CidrRange>> =
    LazyLock::new(|| PRIVATE_CIDRS.iter().filter_map(|c| CidrRange::parse(c)).collect());

static CLOUDFLARE_RANGES: LazyLock<Vec<CidrRange>> =
    LazyLock::new(|| CLOUDFLARE_CIDRS.iter().filter_map(|c| CidrRange::parse(c)).collect());

// =============================================================================
// CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    /// Network address
    network: IpAddr,
    /// Prefix length (e.g., 24 for /24)
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is treated as /32 or /128. Returns `None` if the
    /// format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix_len = match prefix {
            Some(p) => p.parse().ok()?,
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

/// Whether `ip` is in a private, loopback or link-local range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    PRIVATE_RANGES.iter().any(|range| range.contains(ip))
}

/// Whether `ip` belongs to Cloudflare's edge network.
pub fn is_cloudflare_ip(ip: &IpAddr) -> bool {
    CLOUDFLARE_RANGES.iter().any(|range| range.contains(ip))
}

/// Parse a header candidate as an IP address, tolerating surrounding spaces.
#[inline]
pub fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

// =============================================================================
// Extraction
// =============================================================================

/// Where the client address was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp {
    FromHeader(&'static str, IpAddr),
    FromXff(IpAddr),
    FromPeer(IpAddr),
    NotFound,
}

#[inline]
fn header_ip<B>(req: &Request<B>, name: &'static str) -> Option<IpAddr> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_ip)
}

fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn extract_ip_from_request<B>(req: &Request<B>) -> ExtractedIp {
    for name in [CF_CONNECTING_IP, TRUE_CLIENT_IP, X_REAL_IP] {
        if let Some(ip) = header_ip(req, name) {
            return ExtractedIp::FromHeader(name, ip);
        }
    }

    // Format: "client, proxy1, proxy2". Internal hops are skipped.
    if let Some(xff) = req.headers().get(X_FORWARDED_FOR)
        && let Ok(value) = xff.to_str()
        && let Some(ip) = value
            .split(',')
            .filter_map(parse_ip)
            .find(|ip| !is_private_ip(ip))
    {
        return ExtractedIp::FromXff(ip);
    }

    match peer_addr(req) {
        Some(ip) => ExtractedIp::FromPeer(ip),
        None => ExtractedIp::NotFound,
    }
}

/// Extract the client IP from a request.
///
/// Returns `Cow::Borrowed` for the [`UNKNOWN_IP`] fallback (no allocation).
#[inline]
pub fn extract_client_ip<B>(req: &Request<B>) -> Cow<'static, str> {
    match extract_ip_from_request(req) {
        ExtractedIp::FromHeader(_, ip) | ExtractedIp::FromXff(ip) | ExtractedIp::FromPeer(ip) => {
            Cow::Owned(ip.to_string())
        }
        ExtractedIp::NotFound => Cow::Borrowed(UNKNOWN_IP),
    }
}

/// Whether the request carries any Cloudflare-added header.
pub fn is_cloudflare_request<B>(req: &Request<B>) -> bool {
    [CF_RAY, CF_CONNECTING_IP, CF_VISITOR]
        .iter()
        .any(|name| req.headers().contains_key(*name))
}

// =============================================================================
// IP Extraction Stage
// =============================================================================

/// Builds the [`RequestContext`] for every request.
#[derive(Clone, Default)]
pub struct IpExtractionLayer;

impl IpExtractionLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for IpExtractionLayer {
    type Service = IpExtractionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpExtractionService { inner }
    }
}

#[derive(Clone)]
pub struct IpExtractionService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for IpExtractionService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let client_ip: Arc<str> = extract_client_ip(&req).into();
        let scope = RequestScope::of(&req);

        // The tracer normally runs first; used standalone, mint an id here.
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .cloned()
            .or_else(|| scope.request_id().cloned())
            .unwrap_or_else(RequestId::generate);

        scope.set_client_ip(client_ip.clone());
        Span::current().record("client_ip", &*client_ip);

        let ctx = RequestContext::new(request_id, client_ip, scope.started_at());
        req.extensions_mut().insert(ctx);

        self.inner.call(req)
    }
}

// =============================================================================
// Cloudflare Validation Stage
// =============================================================================

/// Reports requests that carry Cloudflare headers but did not arrive from
/// Cloudflare's network. Such requests are logged, never blocked.
#[derive(Clone)]
pub struct CloudflareValidationLayer {
    logger: SharedLogger,
}

impl CloudflareValidationLayer {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for CloudflareValidationLayer {
    type Service = CloudflareValidationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CloudflareValidationService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CloudflareValidationService<S> {
    inner: S,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for CloudflareValidationService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if is_cloudflare_request(&req) {
            let peer = peer_addr(&req);
            if !peer.is_some_and(|ip| is_cloudflare_ip(&ip)) {
                let mut event = Event::new(EventKind::CloudflareSpoof)
                    .with(
                        "remote_addr",
                        peer.map_or_else(|| UNKNOWN_IP.to_string(), |ip| ip.to_string()),
                    )
                    .with(
                        "cf_ray",
                        req.headers()
                            .get(CF_RAY)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or(""),
                    )
                    .with("path", req.uri().path());
                if let Some(ctx) = req.extensions().get::<RequestContext>() {
                    event = event.with_context(ctx);
                }
                self.logger.log(event);
            }
        }

        self.inner.call(req)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::MemoryLogger;
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn with_peer(mut req: Request<Body>, peer: &str) -> Request<Body> {
        let addr: SocketAddr = peer.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[test]
    fn test_extract_ip_header_priority() {
        let req = Request::builder()
            .header("x-forwarded-for", "8.8.8.8")
            .header("x-real-ip", "9.9.9.9")
            .header("true-client-ip", "1.0.0.1")
            .header("cf-connecting-ip", "1.1.1.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "1.1.1.1");

        let req = Request::builder()
            .header("x-forwarded-for", "8.8.8.8")
            .header("x-real-ip", "9.9.9.9")
            .header("true-client-ip", "1.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "1.0.0.1");

        let req = Request::builder()
            .header("x-forwarded-for", "8.8.8.8")
            .header("x-real-ip", "9.9.9.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_client_ip(&req), "9.9.9.9");
    }

    #[test]
    fn test_extract_ip_xff_skips_private_hops() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.1, 192.168.1.1, 203.0.113.50, 8.8.8.8")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "203.0.113.50");
    }

    #[test]
    fn test_extract_ip_xff_all_private_falls_back_to_peer() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.1, 127.0.0.1")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "198.51.100.7:4000");

        assert_eq!(extract_client_ip(&req), "198.51.100.7");
    }

    #[test]
    fn test_extract_ip_invalid_candidates_are_skipped() {
        let req = Request::builder()
            .header("cf-connecting-ip", "not-an-ip")
            .header("x-real-ip", "192.168.1.1:8080")
            .header("x-forwarded-for", "garbage, 2001:db8::1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "2001:db8::1");
    }

    #[test]
    fn test_extract_ip_with_whitespace() {
        let req = Request::builder()
            .header("x-real-ip", "  203.0.113.9  ")
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "203.0.113.9");
    }

    #[test]
    fn test_extract_ip_unknown_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let ip = extract_client_ip(&req);
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_extract_ip_long_proxy_chain() {
        let long_chain = (0..100)
            .map(|i| format!("10.0.0.{}", i % 256))
            .chain(std::iter::once("203.0.113.1".to_string()))
            .collect::<Vec<_>>()
            .join(", ");

        let req = Request::builder()
            .header("x-forwarded-for", &long_chain)
            .body(Body::empty())
            .unwrap();

        assert_eq!(extract_client_ip(&req), "203.0.113.1");
    }

    // ==========================================================================
    // CIDR Range Tests
    // ==========================================================================

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("10.0.0.0/x").is_none());
    }

    #[test]
    fn test_cidr_contains_ipv4() {
        let cidr = CidrRange::parse("172.16.0.0/12").unwrap();

        assert!(cidr.contains(&"172.16.0.1".parse().unwrap()));
        assert!(cidr.contains(&"172.31.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"172.32.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_private_ranges() {
        for ip in ["10.1.2.3", "192.168.0.1", "127.0.0.1", "169.254.1.1", "::1", "fd00::1", "fe80::1"] {
            assert!(is_private_ip(&ip.parse().unwrap()), "{ip} should be private");
        }
        for ip in ["8.8.8.8", "203.0.113.5", "2001:db8::1"] {
            assert!(!is_private_ip(&ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[test]
    fn test_cloudflare_ranges() {
        assert!(is_cloudflare_ip(&"104.16.0.1".parse().unwrap()));
        assert!(is_cloudflare_ip(&"173.245.48.10".parse().unwrap()));
        assert!(!is_cloudflare_ip(&"8.8.8.8".parse().unwrap()));
    }

    // ==========================================================================
    // Stage Tests
    // ==========================================================================

    #[tokio::test]
    async fn test_extraction_stage_builds_context() {
        let svc = IpExtractionLayer::new().layer(tower::service_fn(|req: Request<Body>| async move {
            let ctx = req.extensions().get::<RequestContext>().unwrap();
            let body = format!("{}|{}", ctx.client_ip(), ctx.request_id());
            Ok::<_, Infallible>(Response::new(Body::from(body)))
        }));

        let scope = RequestScope::new();
        scope.set_request_id(RequestId::new("abc"));
        let mut req = Request::builder()
            .header("x-real-ip", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(scope.clone());

        let resp = svc.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"203.0.113.7|abc");
        assert_eq!(scope.client_ip(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_cloudflare_spoof_is_logged_not_blocked() {
        let logger = MemoryLogger::new();
        let svc = CloudflareValidationLayer::new(logger.clone()).layer(tower::service_fn(
            |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::empty())) },
        ));

        let req = Request::builder()
            .header("cf-connecting-ip", "203.0.113.7")
            .header("cf-ray", "abc123")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "8.8.8.8:5000");

        let resp = svc.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        assert_eq!(logger.count(EventKind::CloudflareSpoof), 1);
        let event = &logger.events()[0];
        assert_eq!(event.field("remote_addr"), Some("8.8.8.8"));
        assert_eq!(event.field("cf_ray"), Some("abc123"));

        // Genuine Cloudflare peer: nothing logged.
        let req = Request::builder()
            .header("cf-connecting-ip", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "104.16.0.1:443");
        svc.clone().oneshot(req).await.unwrap();

        // No Cloudflare headers at all: nothing logged.
        let req = with_peer(Request::builder().body(Body::empty()).unwrap(), "8.8.8.8:5000");
        svc.oneshot(req).await.unwrap();

        assert_eq!(logger.count(EventKind::CloudflareSpoof), 1);
    }
}
