//! Request ID middleware for distributed tracing.
//!
//! # Features
//!
//! - Propagates an inbound `X-Request-ID` when it is non-empty and a valid
//!   header value; otherwise generates a UUIDv4
//! - Stores the id as a typed [`RequestId`] extension and in the request's
//!   own `X-Request-ID` header, so it reaches the backend
//! - Opens the per-request `request` span (`request_id`, `method`, `path`,
//!   `client_ip`) that every later log line is recorded under
//! - Adds `X-Request-ID` to every response that passes through it
//!
//! # Client Usage
//!
//! ```bash
//! curl -H "X-Request-ID: my-correlation-id" http://localhost:8082/service-a/items
//! ```
//!
//! The same ID will be returned in the response for correlation.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Instrument, field, info_span};

use crate::context::{REQUEST_ID_HEADER, RequestId, RequestScope};

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    /// Create a new request ID layer.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
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
        let (request_id, header_value) = extract_or_generate_request_id(&req);

        // Round-trip the id to the backend and expose it to later stages.
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        req.extensions_mut().insert(request_id.clone());
        RequestScope::of(&req).set_request_id(request_id.clone());

        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
            client_ip = field::Empty,
        );

        // Nested stages run their synchronous `call` inside the span too.
        let future = {
            let _entered = span.enter();
            self.inner.call(req)
        };

        Box::pin(
            async move {
                let mut response = future.await?;
                response
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, header_value);
                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Extract the request ID from headers or generate a new one.
///
/// Returns the id together with its header encoding.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> (RequestId, HeaderValue) {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.trim().is_empty()
    {
        return (RequestId::new(value), header_value.clone());
    }

    let id = RequestId::generate();
    // A UUID is always a valid header value.
    let value = HeaderValue::from_str(id.as_str())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    (id, value)
}

/// Extension trait to read the request ID assigned by [`RequestIdLayer`].
pub trait RequestIdExt {
    fn request_id(&self) -> Option<RequestId>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<RequestId> {
        self.extensions().get::<RequestId>().cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::ServiceExt;
    use uuid::Uuid;

    #[test]
    fn test_extract_existing_request_id() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        let (id, value) = extract_or_generate_request_id(&req);
        assert_eq!(id.as_str(), "existing-id-123");
        assert_eq!(value, "existing-id-123");
    }

    #[test]
    fn test_generate_new_request_id() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let (id, _) = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_blank_request_id_is_replaced() {
        let req = Request::builder()
            .header("x-request-id", "   ")
            .body(Body::empty())
            .unwrap();

        let (id, _) = extract_or_generate_request_id(&req);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_visible_downstream_and_echoed() {
        let svc = RequestIdLayer::new().layer(tower::service_fn(|req: Request<Body>| async move {
            let ext = req.request_id().unwrap();
            let header = req.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
            assert_eq!(ext.as_str(), header);
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));

        let scope = RequestScope::new();
        let mut req = Request::builder()
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(scope.clone());

        let resp = svc.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "abc-123");
        assert_eq!(scope.request_id().unwrap().as_str(), "abc-123");
    }

    #[tokio::test]
    async fn test_generated_id_echoed() {
        let svc = RequestIdLayer::new().layer(tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));

        let resp = svc
            .oneshot(Request::builder().body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = resp.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[test]
    fn test_request_id_ext_trait_none() {
        let req = Request::builder().body(Body::empty()).unwrap();

        assert!(req.request_id().is_none());
    }
}
