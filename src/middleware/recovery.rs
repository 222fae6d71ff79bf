//! Outermost stage: turns any panic in the pipeline into one 500 response.
//!
//! Two kinds of panic are caught:
//! - raised synchronously while a nested stage builds its future (`call`)
//! - raised while that future is polled, including panics the timeout stage
//!   re-raises from its spawned task
//!
//! This stage also creates the [`RequestScope`] every later stage writes its
//! request id, client IP and committed status into, so the details are
//! available here even when the panic happened deep inside the chain.
//!
//! The panic hook installed by the binary logs location and backtrace; this
//! stage logs the request side (method, path, client IP, request id).

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures::FutureExt;
use tower::{Layer, Service};

use super::ip::UNKNOWN_IP;
use crate::context::{REQUEST_ID_HEADER, RequestId, RequestScope};
use crate::error::GatewayError;
use crate::events::{Event, EventKind, SharedLogger};
use crate::metrics;

#[derive(Clone)]
pub struct RecoveryLayer {
    logger: SharedLogger,
}

impl RecoveryLayer {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RecoveryService<S> {
    inner: S,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for RecoveryService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let scope = RequestScope::new();
        req.extensions_mut().insert(scope.clone());

        let details = PanicDetails {
            logger: self.logger.clone(),
            scope,
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            inbound_id: req
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string),
        };

        let inner = &mut self.inner;
        let called = std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req)));

        Box::pin(async move {
            let outcome = match called {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            match outcome {
                Ok(result) => result,
                Err(panic) => Ok(details.recover(panic.as_ref())),
            }
        })
    }
}

/// What the recovery stage knows about a request when it panics.
struct PanicDetails {
    logger: SharedLogger,
    scope: RequestScope,
    method: Method,
    path: String,
    inbound_id: Option<String>,
}

impl PanicDetails {
    fn recover(self, panic: &(dyn Any + Send)) -> Response<Body> {
        let request_id = self
            .scope
            .request_id()
            .cloned()
            .or_else(|| self.inbound_id.map(RequestId::new))
            .unwrap_or_else(RequestId::generate);

        // Claimed for the record; the 500 is returned either way.
        let _ = self
            .scope
            .capture()
            .record(StatusCode::INTERNAL_SERVER_ERROR);

        self.logger.log(
            Event::new(EventKind::PanicRecovered)
                .with("request_id", &request_id)
                .with("client_ip", self.scope.client_ip().unwrap_or(UNKNOWN_IP))
                .with("method", &self.method)
                .with("path", &self.path)
                .with("panic", panic_message(panic)),
        );
        metrics::record_panic_recovered();

        let mut response =
            GatewayError::Internal("panic recovered".to_string()).into_response();
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::MemoryLogger;
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct PanicsInCall;

    impl Service<Request<Body>> for PanicsInCall {
        type Response = Response<Body>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Response<Body>, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            panic!("boom in call");
        }
    }

    #[tokio::test]
    async fn test_sync_panic_becomes_500() {
        let logger = MemoryLogger::new();
        let svc = RecoveryLayer::new(logger.clone()).layer(PanicsInCall);

        let req = Request::builder()
            .uri("/explode")
            .header(REQUEST_ID_HEADER, "trace-1")
            .body(Body::empty())
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "trace-1");
        assert_eq!(logger.count(EventKind::PanicRecovered), 1);

        let event = &logger.events()[0];
        assert_eq!(event.field("panic"), Some("boom in call"));
        assert_eq!(event.field("path"), Some("/explode"));
        assert_eq!(event.field("client_ip"), Some(UNKNOWN_IP));
    }

    #[tokio::test]
    async fn test_async_panic_becomes_500_with_scope_id() {
        let logger = MemoryLogger::new();
        let svc = RecoveryLayer::new(logger.clone()).layer(tower::service_fn(
            |req: Request<Body>| async move {
                let scope = RequestScope::of(&req);
                scope.set_request_id(RequestId::new("scoped-id"));
                scope.set_client_ip("203.0.113.5".into());
                tokio::task::yield_now().await;
                if scope.request_id().is_some() {
                    panic!("boom in poll: {}", 42);
                }
                Ok::<_, Infallible>(Response::new(Body::empty()))
            },
        ));

        let resp = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "scoped-id");

        let event = &logger.events()[0];
        assert_eq!(event.field("panic"), Some("boom in poll: 42"));
        assert_eq!(event.field("client_ip"), Some("203.0.113.5"));
    }

    #[tokio::test]
    async fn test_panic_response_body_is_generic() {
        let svc = RecoveryLayer::new(MemoryLogger::new()).layer(PanicsInCall);
        let resp = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "internal_error");
        assert!(!String::from_utf8_lossy(&body).contains("boom"));
    }

    #[tokio::test]
    async fn test_normal_response_untouched() {
        let logger = MemoryLogger::new();
        let svc = RecoveryLayer::new(logger.clone()).layer(tower::service_fn(
            |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::from("fine"))) },
        ));

        let resp = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(logger.count(EventKind::PanicRecovered), 0);
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic payload");
    }
}
