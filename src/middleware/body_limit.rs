//! Request body size limit.
//!
//! A declared `Content-Length` above the limit is rejected with 413 before
//! anything downstream runs. An unparsable `Content-Length` is rejected with
//! 400. Every other body is wrapped in [`http_body_util::Limited`], so a
//! chunked body that grows past the limit fails while the forwarder buffers
//! it (and becomes 413 there, see [`is_length_limit_error`]).

use std::error::Error as StdError;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use http_body_util::{LengthLimitError, Limited};
use tower::{Layer, Service};

use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::events::{Event, EventKind, SharedLogger};

#[derive(Clone)]
pub struct BodyLimitLayer {
    max_bytes: usize,
    logger: SharedLogger,
}

impl BodyLimitLayer {
    pub fn new(max_bytes: usize, logger: SharedLogger) -> Self {
        Self { max_bytes, logger }
    }
}

impl<S> Layer<S> for BodyLimitLayer {
    type Service = BodyLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BodyLimitService {
            inner,
            max_bytes: self.max_bytes,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BodyLimitService<S> {
    inner: S,
    max_bytes: usize,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for BodyLimitService<S>
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
        if let Some(value) = req.headers().get(CONTENT_LENGTH) {
            let declared = value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok());

            let rejection = match declared {
                Some(len) if len > self.max_bytes as u64 => Some((
                    Event::new(EventKind::RequestTooLarge)
                        .with("content_length", len)
                        .with("max_bytes", self.max_bytes)
                        .with("exceeded_by", len - self.max_bytes as u64),
                    GatewayError::PayloadTooLarge {
                        limit: self.max_bytes,
                    },
                )),
                Some(_) => None,
                None => Some((
                    Event::new(EventKind::MalformedRequest)
                        .with("content_length", String::from_utf8_lossy(value.as_bytes())),
                    GatewayError::BadRequest("invalid Content-Length".to_string()),
                )),
            };

            if let Some((mut event, error)) = rejection {
                event = event
                    .with("method", req.method())
                    .with("path", req.uri().path());
                if let Some(ctx) = req.extensions().get::<RequestContext>() {
                    event = event.with_context(ctx);
                }
                self.logger.log(event);

                let response = error.into_response();
                return Box::pin(async move { Ok(response) });
            }
        }

        let max_bytes = self.max_bytes;
        let req = req.map(|body| Body::new(Limited::new(body, max_bytes)));
        Box::pin(self.inner.call(req))
    }
}

/// Whether `err` (or anything in its source chain) is a body length overflow.
pub fn is_length_limit_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
