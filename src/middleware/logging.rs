//! Innermost stage: request start/completion logging and status capture.
//!
//! Completion is logged at a level chosen by outcome (5xx error, 4xx warn,
//! otherwise info) with method, path, status, duration, client IP and request
//! id. The status is recorded in the request's [`ResponseCapture`]; when that
//! record loses because the timeout stage already answered 504, the late
//! response is reported as discarded instead of completed.
//!
//! [`ResponseCapture`]: super::capture::ResponseCapture

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tower::{Layer, Service};

use super::ip::UNKNOWN_IP;
use crate::context::{RequestContext, RequestScope};
use crate::events::{Event, EventKind, Severity, SharedLogger};
use crate::metrics;

#[derive(Clone)]
pub struct LoggingLayer {
    logger: SharedLogger,
}

impl LoggingLayer {
    pub fn new(logger: SharedLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for LoggingService<S>
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
        let logger = self.logger.clone();
        let scope = RequestScope::of(&req);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let (request_id, client_ip, started) = match req.extensions().get::<RequestContext>() {
            Some(ctx) => (
                ctx.request_id().to_string(),
                ctx.client_ip().to_string(),
                ctx.start_time(),
            ),
            None => (String::new(), UNKNOWN_IP.to_string(), scope.started_at()),
        };

        logger.log(
            Event::new(EventKind::RequestStarted)
                .with("method", &method)
                .with("path", &path)
                .with("client_ip", &client_ip)
                .with("request_id", &request_id),
        );

        let future = self.inner.call(req);

        Box::pin(async move {
            let response = future.await?;
            let status = response.status();
            let elapsed = started.elapsed();

            if !scope.capture().record(status) {
                logger.log(
                    Event::new(EventKind::LateResponseDiscarded)
                        .with("method", &method)
                        .with("path", &path)
                        .with("status", status.as_u16())
                        .with("committed", scope.capture().status().map_or(0, |s| s.as_u16()))
                        .with("client_ip", &client_ip)
                        .with("request_id", &request_id),
                );
                return Ok(response);
            }

            let severity = if status.is_server_error() {
                Severity::Error
            } else if status.is_client_error() {
                Severity::Warn
            } else {
                Severity::Info
            };

            logger.log(
                Event::new(EventKind::RequestCompleted)
                    .at(severity)
                    .with("method", &method)
                    .with("path", &path)
                    .with("status", status.as_u16())
                    .with("duration_ms", format!("{:.3}", elapsed.as_secs_f64() * 1000.0))
                    .with("client_ip", &client_ip)
                    .with("request_id", &request_id),
            );
            metrics::record_request(method.as_str(), status.as_u16(), elapsed.as_secs_f64());

            Ok(response)
        })
    }
}
