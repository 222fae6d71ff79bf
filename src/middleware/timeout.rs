//! Per-request deadline for the rest of the pipeline.
//!
//! The remaining chain runs as a spawned task carrying the request span. The
//! guard races that task against a sleep of the configured timeout:
//!
//! ```text
//!   downstream done first ──▶ downstream response
//!   deadline first ──▶ claim 504 in ResponseCapture
//!                        ├─ claim won  ──▶ cancel token, answer 504 now
//!                        └─ claim lost ──▶ downstream already committed, await it
//! ```
//!
//! A [`Cancellation`] token is inserted into the request extensions before
//! the task starts. The forwarder selects on it, so a timed-out backend call
//! is dropped instead of running to completion in the background.
//!
//! The deadline covers the whole exchange, body included. A response that
//! beats it gets its body bounded by the same deadline: a body still
//! streaming when it passes is ended there and the token fires. The token
//! also fires when the caller goes away (the guard future or the response
//! body is dropped).
//!
//! Panics inside the spawned task come back as a `JoinError`; they are
//! re-raised here so the recovery stage observes them like any other panic.

use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures::StreamExt;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower::{Layer, Service};
use tracing::{Instrument, Span};

use crate::context::{Cancellation, RequestContext, RequestScope};
use crate::error::GatewayError;
use crate::events::{Event, EventKind, SharedLogger};
use crate::metrics;

#[derive(Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
    logger: SharedLogger,
}

impl TimeoutLayer {
    pub fn new(timeout: Duration, logger: SharedLogger) -> Self {
        Self { timeout, logger }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for TimeoutService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
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
        let timeout = self.timeout;
        let logger = self.logger.clone();
        let scope = RequestScope::of(&req);
        let ctx = req.extensions().get::<RequestContext>().cloned();
        let method = req.method().as_str().to_string();
        let path = req.uri().path().to_string();

        let deadline = Instant::now() + timeout;
        let token = CancellationToken::new();
        req.extensions_mut().insert(Cancellation(token.clone()));
        let guard = token.clone().drop_guard();

        // The clone stays behind; the readied service goes into the task.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let mut task = tokio::spawn(async move { inner.call(req).await }.instrument(Span::current()));

        let expired = TimeoutReport {
            logger,
            ctx,
            method,
            path,
            timeout,
        };

        Box::pin(async move {
            tokio::select! {
                joined = &mut task => {
                    return join_result(joined)
                        .map(|resp| bound_body(resp, deadline, guard, expired));
                }
                () = tokio::time::sleep_until(deadline) => {}
            }

            if !scope.capture().record(StatusCode::GATEWAY_TIMEOUT) {
                // Downstream committed its status first; its response stands.
                return join_result(task.await)
                    .map(|resp| bound_body(resp, deadline, guard, expired));
            }

            token.cancel();
            expired.emit("headers");

            Ok(GatewayError::Timeout(timeout).into_response())
        })
    }
}

/// What gets logged when the deadline passes.
struct TimeoutReport {
    logger: SharedLogger,
    ctx: Option<RequestContext>,
    method: String,
    path: String,
    timeout: Duration,
}

impl TimeoutReport {
    fn emit(&self, phase: &'static str) {
        let mut event = Event::new(EventKind::RequestTimeout)
            .with("method", &self.method)
            .with("path", &self.path)
            .with("timeout_ms", self.timeout.as_millis())
            .with("phase", phase);
        if let Some(ctx) = &self.ctx {
            event = event.with_context(ctx);
        }
        self.logger.log(event);
        metrics::record_timeout();
    }
}

/// End the response body at `deadline`.
///
/// `guard` lives inside the stop future: it is dropped, firing the token,
/// when the deadline cuts the body or when the body itself is dropped.
fn bound_body(
    resp: Response<Body>,
    deadline: Instant,
    guard: DropGuard,
    expired: TimeoutReport,
) -> Response<Body> {
    resp.map(|body| {
        let stop = async move {
            tokio::time::sleep_until(deadline).await;
            expired.emit("body");
            drop(guard);
        };
        Body::from_stream(body.into_data_stream().take_until(stop))
    })
}

/// Unwrap the spawned task's outcome, re-raising its panic on this task.
fn join_result<E>(
    joined: Result<Result<Response<Body>, E>, JoinError>,
) -> Result<Response<Body>, E> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => {
            Ok(GatewayError::Internal(format!("downstream task aborted: {err}")).into_response())
        }
    }
}
