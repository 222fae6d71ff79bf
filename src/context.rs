//! Strongly typed, request-scoped values threaded through the pipeline.
//!
//! All of these live in the request's extensions under their own types, so
//! stages never share state through string keys.
//!
//! | Type | Inserted by | Read by |
//! |------|-------------|---------|
//! | [`RequestScope`] | recovery (outermost) | tracer, IP extraction, timeout, logging, recovery |
//! | [`RequestId`] | tracer | IP extraction, CORS logging |
//! | [`RequestContext`] | IP extraction | every later stage, forwarder |
//! | [`Cancellation`] | timeout | forwarder |

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::http::Request;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::middleware::capture::ResponseCapture;

/// Header carrying the correlation id, inbound and outbound.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation identifier of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Fresh random UUIDv4 identifier (122 bits of entropy).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable per-request context: who is calling, under which id, since when.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    client_ip: Arc<str>,
    start_time: Instant,
}

impl RequestContext {
    pub fn new(request_id: RequestId, client_ip: impl Into<Arc<str>>, start_time: Instant) -> Self {
        Self {
            request_id,
            client_ip: client_ip.into(),
            start_time,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Per-request handle shared by every stage of one exchange.
///
/// Created by the outermost stage before anything else runs, so it exists
/// even when a later stage panics. The id and IP slots are write-once: the
/// tracer and the IP extraction stage fill them, the recovery stage reads
/// them back for its log entry and its 500 response.
#[derive(Debug, Clone)]
pub struct RequestScope(Arc<ScopeInner>);

#[derive(Debug)]
struct ScopeInner {
    started_at: Instant,
    request_id: OnceLock<RequestId>,
    client_ip: OnceLock<Arc<str>>,
    capture: ResponseCapture,
}

impl RequestScope {
    pub fn new() -> Self {
        Self(Arc::new(ScopeInner {
            started_at: Instant::now(),
            request_id: OnceLock::new(),
            client_ip: OnceLock::new(),
            capture: ResponseCapture::default(),
        }))
    }

    /// Scope attached to `req`, or a detached one when the request did not
    /// pass through the recovery stage (stages used on their own).
    pub fn of<B>(req: &Request<B>) -> Self {
        req.extensions()
            .get::<RequestScope>()
            .cloned()
            .unwrap_or_default()
    }

    pub fn started_at(&self) -> Instant {
        self.0.started_at
    }

    pub fn set_request_id(&self, id: RequestId) {
        let _ = self.0.request_id.set(id);
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.0.request_id.get()
    }

    pub fn set_client_ip(&self, ip: Arc<str>) {
        let _ = self.0.client_ip.set(ip);
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.0.client_ip.get().map(|ip| ip.as_ref())
    }

    /// Write-once record of the status this exchange answered with.
    pub fn capture(&self) -> &ResponseCapture {
        &self.0.capture
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancellation signal for the downstream work of one request.
///
/// Fired by the timeout stage when its deadline wins; the forwarder selects
/// on it and drops the backend call.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(pub CancellationToken);

impl Cancellation {
    pub fn of<B>(req: &Request<B>) -> Option<CancellationToken> {
        req.extensions()
            .get::<Cancellation>()
            .map(|c| c.0.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;

    #[test]
    fn test_generated_ids_are_uuids_and_distinct() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert!(Uuid::parse_str(a.as_str()).is_ok());
        assert_ne!(a, b);
    }

    #[test]
    fn test_scope_slots_are_write_once() {
        let scope = RequestScope::new();
        scope.set_request_id(RequestId::new("first"));
        scope.set_request_id(RequestId::new("second"));
        assert_eq!(scope.request_id().unwrap().as_str(), "first");

        scope.set_client_ip("10.0.0.1".into());
        scope.set_client_ip("10.0.0.2".into());
        assert_eq!(scope.client_ip(), Some("10.0.0.1"));
    }

    #[test]
    fn test_scope_of_shares_state_with_request() {
        let scope = RequestScope::new();
        let mut req = Request::builder().body(Body::empty()).unwrap();
        req.extensions_mut().insert(scope.clone());

        assert!(RequestScope::of(&req).capture().record(StatusCode::OK));
        assert_eq!(scope.capture().status(), Some(StatusCode::OK));
    }

    #[test]
    fn test_scope_of_detached_when_missing() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let scope = RequestScope::of(&req);
        assert!(scope.request_id().is_none());
        assert!(scope.capture().status().is_none());
    }

    #[test]
    fn test_cancellation_lookup() {
        let mut req = Request::builder().body(Body::empty()).unwrap();
        assert!(Cancellation::of(&req).is_none());

        let token = CancellationToken::new();
        req.extensions_mut().insert(Cancellation(token.clone()));
        token.cancel();
        assert!(Cancellation::of(&req).unwrap().is_cancelled());
    }
}
