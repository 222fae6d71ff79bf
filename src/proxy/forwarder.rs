//! Reverse proxy forwarder: the innermost service of the pipeline.
//!
//! Resolves the route, rewrites the URL, copies the request to the backend
//! over one pooled `reqwest::Client` and streams the backend response back.
//!
//! # Failure Mapping
//!
//! | Condition | Status |
//! |-----------|--------|
//! | No route matches the path | 404 |
//! | Body grows past the limit while buffering | 413 |
//! | Body cannot be read | 400 |
//! | Connect / DNS / protocol failure talking to the backend | 502 |
//! | Request cancelled by the timeout stage | 504 (discarded, the timeout already answered) |
//!
//! No retries are attempted; every failure is answered once.
//!
//! The cancellation token is honoured while buffering the request body,
//! while waiting for the backend, and while streaming the response body.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Request, Response};
use axum::response::IntoResponse;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::debug;

use super::route::RouteTable;
use crate::config::Config;
use crate::context::{Cancellation, REQUEST_ID_HEADER, RequestContext, RequestId};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{Event, EventKind, SharedLogger};
use crate::metrics;
use crate::middleware::UNKNOWN_IP;
use crate::middleware::body_limit::is_length_limit_error;

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Transport settings of the shared backend client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Connect timeout, TLS handshake included
    pub connect_timeout: Duration,
    /// Idle pooled connections are closed after this long
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Largest request body buffered for forwarding
    pub max_body_bytes: usize,
}

impl UpstreamConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.upstream_connect_timeout,
            pool_idle_timeout: config.upstream_pool_idle_timeout,
            pool_max_idle_per_host: config.upstream_pool_max_idle_per_host,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 100,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Tower service forwarding requests to the backend selected by prefix.
///
/// Cheap to clone: the client, its connection pool and the route table are
/// shared behind one `Arc`.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Forwarder>,
}

struct Forwarder {
    client: reqwest::Client,
    routes: RouteTable,
    max_body_bytes: usize,
    logger: SharedLogger,
}

impl ProxyService {
    /// Build the forwarder and its pooled client.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if the HTTP client cannot be built.
    pub fn new(
        routes: RouteTable,
        upstream: UpstreamConfig,
        logger: SharedLogger,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(upstream.connect_timeout)
            .pool_idle_timeout(upstream.pool_idle_timeout)
            .pool_max_idle_per_host(upstream.pool_max_idle_per_host)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| {
                GatewayError::ConfigError(format!("Failed to build upstream HTTP client: {e}"))
            })?;

        Ok(Self {
            inner: Arc::new(Forwarder {
                client,
                routes,
                max_body_bytes: upstream.max_body_bytes,
                logger,
            }),
        })
    }

    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` for invalid routes or client settings.
    pub fn from_config(config: &Config, logger: SharedLogger) -> GatewayResult<Self> {
        let routes = RouteTable::new(config.routes.clone())?;
        Self::new(routes, UpstreamConfig::from_config(config), logger)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }
}

impl Service<Request<Body>> for ProxyService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { Ok(inner.forward(req).await) })
    }
}

impl Forwarder {
    async fn forward(&self, req: Request<Body>) -> Response<Body> {
        let ctx = req.extensions().get::<RequestContext>().cloned();
        let request_id = ctx
            .as_ref()
            .map(|c| c.request_id().clone())
            .or_else(|| req.extensions().get::<RequestId>().cloned());
        let cancel = Cancellation::of(&req);
        let path = req.uri().path().to_string();

        let Some(route) = self.routes.resolve(&path, req.uri().query()) else {
            self.report(Event::new(EventKind::RouteNotFound).with("path", &path), ctx.as_ref());
            return GatewayError::RouteNotFound(path).into_response();
        };
        let prefix = route.route.prefix.clone();
        let target = route.target;

        let (parts, body) = req.into_parts();
        let client_ip = ctx.as_ref().map(|c| c.client_ip());
        let headers = outbound_headers(&parts.headers, request_id.as_ref(), client_ip);

        let buffered =
            race_cancellation(cancel.as_ref(), axum::body::to_bytes(body, self.max_body_bytes))
                .await;
        let body = match buffered {
            None => {
                debug!(path = %path, "Request body dropped, request was cancelled");
                return GatewayError::Cancelled.into_response();
            }
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) if is_length_limit_error(&err) => {
                self.report(
                    Event::new(EventKind::RequestTooLarge)
                        .with("path", &path)
                        .with("max_bytes", self.max_body_bytes),
                    ctx.as_ref(),
                );
                return GatewayError::PayloadTooLarge {
                    limit: self.max_body_bytes,
                }
                .into_response();
            }
            Some(Err(err)) => {
                self.report(
                    Event::new(EventKind::MalformedRequest)
                        .with("path", &path)
                        .with("error", &err),
                    ctx.as_ref(),
                );
                return GatewayError::BadRequest(err.to_string()).into_response();
            }
        };

        let send = self
            .client
            .request(parts.method.clone(), &target)
            .headers(headers)
            .body(body)
            .send();

        let upstream = race_cancellation(cancel.as_ref(), send).await;

        match upstream {
            None => {
                debug!(target_url = %target, "Backend call dropped, request was cancelled");
                GatewayError::Cancelled.into_response()
            }
            Some(Ok(resp)) => inbound_response(resp, request_id.as_ref(), cancel),
            Some(Err(err)) => {
                let kind = classify(&err);
                self.report(
                    Event::new(EventKind::UpstreamFailed)
                        .with("method", &parts.method)
                        .with("path", &path)
                        .with("prefix", &prefix)
                        .with("target", &target)
                        .with("kind", kind)
                        .with("error", &err),
                    ctx.as_ref(),
                );
                metrics::record_upstream_error(kind);
                GatewayError::BadGateway(err.to_string()).into_response()
            }
        }
    }

    fn report(&self, event: Event, ctx: Option<&RequestContext>) {
        let event = match ctx {
            Some(ctx) => event.with_context(ctx),
            None => event,
        };
        self.logger.log(event);
    }
}

/// Run `fut` unless `token` fires first. `None` means cancelled; the
/// in-flight future, and with it the backend connection, is dropped.
async fn race_cancellation<F: std::future::Future>(
    token: Option<&CancellationToken>,
    fut: F,
) -> Option<F::Output> {
    let Some(token) = token else {
        return Some(fut.await);
    };
    if token.is_cancelled() {
        return None;
    }

    tokio::select! {
        biased;

        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

fn classify(err: &reqwest::Error) -> &'static str {
    if err.is_connect() {
        "connect"
    } else if err.is_timeout() {
        "timeout"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else {
        "request"
    }
}

/// Whether `name` is a hop-by-hop header, either always or because the
/// `Connection` header lists it.
fn is_hop_by_hop(name: &HeaderName, connection_tokens: &[String]) -> bool {
    let name = name.as_str();
    HOP_BY_HOP_HEADERS.contains(&name) || connection_tokens.iter().any(|t| t == name)
}

/// Header names listed in `Connection`, lowercased.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let tokens = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name, &tokens) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Headers sent to the backend.
///
/// Hop-by-hop headers, `Host` and `Content-Length` are dropped (the client
/// sets the last two), the correlation id is set and the client IP is
/// appended to `X-Forwarded-For`.
pub fn outbound_headers(
    inbound: &HeaderMap,
    request_id: Option<&RequestId>,
    client_ip: Option<&str>,
) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(id) = request_id
        && let Ok(value) = HeaderValue::from_str(id.as_str())
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    if let Some(ip) = client_ip.filter(|ip| *ip != UNKNOWN_IP) {
        let prior = headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        let chain = if prior.is_empty() {
            ip.to_string()
        } else {
            format!("{prior}, {ip}")
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers
}

/// Convert the backend response, streaming its body through.
///
/// The stream ends when `cancel` fires, dropping the backend connection.
fn inbound_response(
    resp: reqwest::Response,
    request_id: Option<&RequestId>,
    cancel: Option<CancellationToken>,
) -> Response<Body> {
    let status = resp.status();
    let mut headers = strip_hop_by_hop(resp.headers());
    if let Some(id) = request_id
        && let Ok(value) = HeaderValue::from_str(id.as_str())
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    let body = match cancel {
        Some(token) => Body::from_stream(resp.bytes_stream().take_until(token.cancelled_owned())),
        None => Body::from_stream(resp.bytes_stream()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::MemoryLogger;
    use crate::proxy::ProxyRoute;
    use axum::http::StatusCode;
    use std::time::Instant;
    use tower::ServiceExt;

    fn service(routes: Vec<ProxyRoute>, logger: SharedLogger) -> ProxyService {
        ProxyService::new(
            RouteTable::new(routes).unwrap(),
            UpstreamConfig {
                connect_timeout: Duration::from_secs(2),
                ..UpstreamConfig::default()
            },
            logger,
        )
        .unwrap()
    }

    fn request(path: &str, ip: &str) -> Request<Body> {
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        req.extensions_mut().insert(RequestContext::new(
            RequestId::new("fwd-1"),
            ip,
            Instant::now(),
        ));
        req
    }

    /// A local address nothing listens on.
    async fn closed_port() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[test]
    fn test_outbound_headers_filtering() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("gateway.example.com"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-internal"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert("x-internal", HeaderValue::from_static("secret"));
        inbound.insert(header::CONTENT_LENGTH, HeaderValue::from_static("3"));
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        inbound.insert(REQUEST_ID_HEADER, HeaderValue::from_static("stale"));

        let out = outbound_headers(&inbound, Some(&RequestId::new("abc")), Some("203.0.113.7"));

        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-internal").is_none());
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(out.get(header::AUTHORIZATION).unwrap(), "Bearer t");
        assert_eq!(out.get(REQUEST_ID_HEADER).unwrap(), "abc");
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_for_is_appended() {
        let mut inbound = HeaderMap::new();
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));

        let out = outbound_headers(&inbound, None, Some("203.0.113.7"));
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "198.51.100.1, 203.0.113.7");

        let out = outbound_headers(&inbound, None, Some(UNKNOWN_IP));
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "198.51.100.1");
    }

    #[tokio::test]
    async fn test_no_route_is_404() {
        let logger = MemoryLogger::new();
        let svc = service(
            vec![ProxyRoute::new("/service-a/", "http://service-a:8080")],
            logger.clone(),
        );

        let resp = svc.oneshot(request("/nowhere", "203.0.113.7")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(logger.count(EventKind::RouteNotFound), 1);
        assert_eq!(logger.events()[0].field("request_id"), Some("fwd-1"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let addr = closed_port().await;
        let logger = MemoryLogger::new();
        let svc = service(
            vec![ProxyRoute::new("/down/", format!("http://{addr}"))],
            logger.clone(),
        );

        let resp = svc.oneshot(request("/down/x", "203.0.113.7")).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(logger.count(EventKind::UpstreamFailed), 1);
        assert_eq!(logger.events()[0].field("kind"), Some("connect"));
    }

    #[tokio::test]
    async fn test_cancelled_request_never_reaches_backend() {
        let addr = closed_port().await;
        let logger = MemoryLogger::new();
        let svc = service(
            vec![ProxyRoute::new("/a/", format!("http://{addr}"))],
            logger.clone(),
        );

        let token = CancellationToken::new();
        token.cancel();
        let mut req = request("/a/x", "203.0.113.7");
        req.extensions_mut().insert(Cancellation(token));

        let resp = svc.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(logger.count(EventKind::UpstreamFailed), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let logger = MemoryLogger::new();
        let svc = ProxyService::new(
            RouteTable::new(vec![ProxyRoute::new("/a/", "http://a:1")]).unwrap(),
            UpstreamConfig {
                max_body_bytes: 4,
                ..UpstreamConfig::default()
            },
            logger.clone(),
        )
        .unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/a/upload")
            .body(Body::from("more than four bytes"))
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(logger.count(EventKind::RequestTooLarge), 1);
    }

    #[tokio::test]
    async fn test_stalled_upload_is_dropped_on_cancel() {
        let logger = MemoryLogger::new();
        let svc = service(vec![ProxyRoute::new("/a/", "http://a:1")], logger.clone());

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let upload = futures::stream::pending::<Result<axum::body::Bytes, std::io::Error>>();
        let mut req = Request::builder()
            .method("POST")
            .uri("/a/upload")
            .body(Body::from_stream(upload))
            .unwrap();
        req.extensions_mut().insert(Cancellation(token));

        let started = Instant::now();
        let resp = tokio::time::timeout(Duration::from_secs(2), svc.oneshot(req))
            .await
            .expect("buffering should stop on cancel")
            .unwrap();

        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(logger.count(EventKind::UpstreamFailed), 0);
    }

    #[tokio::test]
    async fn test_backend_body_ends_on_cancel() {
        let stalled = futures::stream::once(async {
            Ok::<_, std::io::Error>(axum::body::Bytes::from("partial"))
        })
        .chain(futures::stream::pending());
        let backend = reqwest::Response::from(
            axum::http::Response::builder()
                .status(200)
                .header(header::CONNECTION, "keep-alive")
                .body(reqwest::Body::wrap_stream(stalled))
                .unwrap(),
        );

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let resp = inbound_response(backend, Some(&RequestId::new("fwd-2")), Some(token));
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "fwd-2");
        assert!(resp.headers().get(header::CONNECTION).is_none());

        let body = tokio::time::timeout(
            Duration::from_secs(2),
            axum::body::to_bytes(resp.into_body(), usize::MAX),
        )
        .await
        .expect("body should end once cancelled")
        .unwrap();
        assert_eq!(&body[..], b"partial");
    }

    #[tokio::test]
    async fn test_race_cancellation_fires_mid_flight() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let out =
            race_cancellation(Some(&token), tokio::time::sleep(Duration::from_secs(10))).await;

        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
