//! CORS and OWASP security headers.
//!
//! # CORS
//!
//! Built on `tower_http::cors::CorsLayer` with an origin predicate:
//!
//! | Configured origin | Matches |
//! |-------------------|---------|
//! | `*` | any origin |
//! | `https://app.example.com` | exactly that origin |
//! | `*.example.com` | any origin whose host ends in `.example.com` |
//!
//! Credentials are allowed, so the layer echoes the concrete origin instead
//! of `*`. Blocked origins are reported through the injected logger.
//!
//! # Security Headers
//!
//! [`SecurityHeadersLayer`] sets the OWASP header set on every response and
//! strips `Server` / `X-Powered-By`. In production it reports requests whose
//! `X-Forwarded-Proto` is not `https`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{Method, Request, Response, request};
use tower::{Layer, Service};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::context::RequestContext;
use crate::events::{Event, EventKind, SharedLogger};

/// Preflight cache lifetime (24 hours).
const CORS_MAX_AGE: Duration = Duration::from_secs(86_400);

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
    script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
    style-src 'self' 'unsafe-inline'; \
    img-src 'self' data: https:; \
    font-src 'self' data:; \
    connect-src 'self'; \
    frame-ancestors 'none'; \
    base-uri 'self'; \
    form-action 'self'";

const PERMISSIONS_POLICY: &str = "accelerometer=(), camera=(), geolocation=(), gyroscope=(), \
    magnetometer=(), microphone=(), payment=(), usb=()";

static X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");
static X_XSS_PROTECTION: HeaderName = HeaderName::from_static("x-xss-protection");
static PERMISSIONS_POLICY_HEADER: HeaderName = HeaderName::from_static("permissions-policy");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

// =============================================================================
// CORS
// =============================================================================

/// One entry of the allowed-origin list.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginRule {
    Any,
    Exact(String),
    /// `*.example.com` stored as `.example.com`
    Suffix(String),
}

impl OriginRule {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw == "*" {
            OriginRule::Any
        } else if let Some(domain) = raw.strip_prefix("*.") {
            OriginRule::Suffix(format!(".{}", domain.to_ascii_lowercase()))
        } else {
            OriginRule::Exact(raw.trim_end_matches('/').to_ascii_lowercase())
        }
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            OriginRule::Any => true,
            OriginRule::Exact(allowed) => origin.eq_ignore_ascii_case(allowed),
            OriginRule::Suffix(suffix) => origin_host(origin)
                .is_some_and(|host| host.to_ascii_lowercase().ends_with(suffix.as_str())),
        }
    }
}

/// Host part of an origin (`scheme://host[:port]`).
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let host = rest.split(['/', ':']).next()?;
    (!host.is_empty()).then_some(host)
}

/// Compiled allowed-origin list.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    rules: Vec<OriginRule>,
}

impl OriginPolicy {
    pub fn new(origins: &[String]) -> Self {
        Self {
            rules: origins
                .iter()
                .filter(|o| !o.trim().is_empty())
                .map(|o| OriginRule::parse(o))
                .collect(),
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(origin))
    }
}

/// Build the CORS layer for `origins`, reporting blocked origins to `logger`.
pub fn cors_layer(origins: &[String], logger: SharedLogger) -> CorsLayer {
    let policy = Arc::new(OriginPolicy::new(origins));

    let predicate = move |origin: &HeaderValue, parts: &request::Parts| {
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        if policy.is_allowed(origin) {
            return true;
        }

        let mut event = Event::new(EventKind::CorsBlocked)
            .with("origin", origin)
            .with("method", &parts.method)
            .with("path", parts.uri.path());
        if let Some(ctx) = parts.extensions.get::<RequestContext>() {
            event = event.with_context(ctx);
        }
        logger.log(event);
        false
    };

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(predicate))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-api-key"),
        ])
        .expose_headers([
            header::LINK,
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
        ])
        .max_age(CORS_MAX_AGE)
}

// =============================================================================
// Security Headers
// =============================================================================

#[derive(Clone)]
pub struct SecurityHeadersLayer {
    production: bool,
    logger: SharedLogger,
}

impl SecurityHeadersLayer {
    pub fn new(production: bool, logger: SharedLogger) -> Self {
        Self { production, logger }
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService {
            inner,
            production: self.production,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
    production: bool,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for SecurityHeadersService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        if self.production && !is_https(&req) {
            let mut event = Event::new(EventKind::InsecureRequest)
                .with("method", req.method())
                .with("path", req.uri().path());
            if let Some(ctx) = req.extensions().get::<RequestContext>() {
                event = event.with_context(ctx);
            }
            self.logger.log(event);
        }

        let future = self.inner.call(req);

        Box::pin(async move {
            let mut response = future.await?;
            apply_security_headers(response.headers_mut());
            Ok(response)
        })
    }
}

fn is_https<B>(req: &Request<B>) -> bool {
    req.uri().scheme_str() == Some("https")
        || req
            .headers()
            .get(&X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

/// Set the OWASP header set and remove server identification.
pub fn apply_security_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        X_XSS_PROTECTION.clone(),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        PERMISSIONS_POLICY_HEADER.clone(),
        HeaderValue::from_static(PERMISSIONS_POLICY),
    );
    headers.remove(header::SERVER);
    headers.remove(&X_POWERED_BY);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::MemoryLogger;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use tower::ServiceExt;

    fn origins(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_origin_policy_rules() {
        let policy = OriginPolicy::new(&origins(&[
            "https://app.example.com",
            "*.trusted.io",
        ]));

        assert!(policy.is_allowed("https://app.example.com"));
        assert!(policy.is_allowed("HTTPS://APP.EXAMPLE.COM"));
        assert!(!policy.is_allowed("https://evil.example.com"));
        assert!(policy.is_allowed("https://api.trusted.io"));
        assert!(policy.is_allowed("http://a.b.trusted.io:8080"));
        assert!(!policy.is_allowed("https://trusted.io.evil.com"));
        assert!(!policy.is_allowed("https://nottrusted.io"));
    }

    #[test]
    fn test_wildcard_allows_everything() {
        let policy = OriginPolicy::new(&origins(&["*"]));
        assert!(policy.is_allowed("https://anything.example"));
    }

    #[test]
    fn test_origin_host() {
        assert_eq!(origin_host("https://a.example.com:8443"), Some("a.example.com"));
        assert_eq!(origin_host("http://localhost"), Some("localhost"));
        assert_eq!(origin_host("https://"), None);
    }

    async fn ok(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let mut resp = Response::new(Body::empty());
        resp.headers_mut()
            .insert(header::SERVER, HeaderValue::from_static("backend/1.0"));
        resp.headers_mut()
            .insert("x-powered-by", HeaderValue::from_static("php"));
        Ok(resp)
    }

    #[tokio::test]
    async fn test_security_headers_applied_and_server_stripped() {
        let logger = MemoryLogger::new();
        let svc = SecurityHeadersLayer::new(false, logger.clone()).layer(tower::service_fn(ok));

        let resp = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        let headers = resp.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert!(headers.contains_key("content-security-policy"));
        assert!(headers.contains_key("permissions-policy"));
        assert!(headers.contains_key("strict-transport-security"));
        assert!(!headers.contains_key("server"));
        assert!(!headers.contains_key("x-powered-by"));
        assert!(logger.events().is_empty());
    }

    #[tokio::test]
    async fn test_insecure_request_logged_in_production() {
        let logger = MemoryLogger::new();
        let svc = SecurityHeadersLayer::new(true, logger.clone()).layer(tower::service_fn(ok));

        svc.clone()
            .oneshot(Request::builder().uri("/plain").body(Body::empty()).unwrap())
            .await
            .unwrap();
        svc.oneshot(
            Request::builder()
                .uri("/tls")
                .header("x-forwarded-proto", "https")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(logger.count(EventKind::InsecureRequest), 1);
        assert_eq!(logger.events()[0].field("path"), Some("/plain"));
    }

    #[tokio::test]
    async fn test_cors_allows_and_blocks() {
        let logger = MemoryLogger::new();
        let svc = cors_layer(&origins(&["https://app.example.com"]), logger.clone())
            .layer(tower::service_fn(|_req: Request<Body>| async {
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }));

        let allowed = svc
            .clone()
            .oneshot(
                Request::builder()
                    .header(header::ORIGIN, "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );
        assert_eq!(
            allowed.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );

        let blocked = svc
            .oneshot(
                Request::builder()
                    .header(header::ORIGIN, "https://evil.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(blocked.status(), StatusCode::OK);
        assert!(!blocked
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(logger.count(EventKind::CorsBlocked), 1);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let svc = cors_layer(&origins(&["*"]), MemoryLogger::new()).layer(tower::service_fn(
            |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::empty())) },
        ));

        let resp = svc
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .header(header::ORIGIN, "https://any.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_MAX_AGE], "86400");
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://any.example"
        );
    }
}
