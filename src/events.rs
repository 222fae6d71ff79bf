//! Structured gateway events and the injectable logger capability.
//!
//! Pipeline stages never call a global logger for notable outcomes. Each
//! stage receives a [`SharedLogger`] in its constructor and reports an
//! [`Event`] through it. The production implementation, [`TracingLogger`],
//! forwards events to `tracing`, so they inherit the per-request span
//! (`request_id`, `method`, `path`, `client_ip`). Tests swap in a
//! [`MemoryLogger`] to assert on what was reported.
//!
//! ```text
//! stage ──Event──▶ SharedLogger ──▶ TracingLogger ──▶ tracing subscriber
//!                                └─▶ MemoryLogger  (tests)
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;

/// Severity an event is reported at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Everything a pipeline stage can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestStarted,
    RequestCompleted,
    LateResponseDiscarded,
    RateLimitExceeded,
    BucketsEvicted,
    RequestTooLarge,
    MalformedRequest,
    RequestTimeout,
    PanicRecovered,
    CorsBlocked,
    InsecureRequest,
    CloudflareSpoof,
    RouteNotFound,
    UpstreamFailed,
}

impl EventKind {
    /// Component namespace the event belongs to.
    pub fn component(self) -> &'static str {
        match self {
            EventKind::RequestStarted
            | EventKind::RequestCompleted
            | EventKind::LateResponseDiscarded => "pipeline.logging",
            EventKind::RateLimitExceeded | EventKind::BucketsEvicted => "pipeline.ratelimit",
            EventKind::RequestTooLarge | EventKind::MalformedRequest => "pipeline.body_limit",
            EventKind::RequestTimeout => "pipeline.timeout",
            EventKind::PanicRecovered => "pipeline.recovery",
            EventKind::CorsBlocked | EventKind::InsecureRequest => "pipeline.security",
            EventKind::CloudflareSpoof => "pipeline.ip",
            EventKind::RouteNotFound | EventKind::UpstreamFailed => "proxy.forwarder",
        }
    }

    /// Default severity. `RequestCompleted` is raised per status by the
    /// logging stage through [`Event::at`].
    pub fn severity(self) -> Severity {
        match self {
            EventKind::RequestStarted | EventKind::BucketsEvicted => Severity::Debug,
            EventKind::RequestCompleted | EventKind::RouteNotFound => Severity::Info,
            EventKind::LateResponseDiscarded
            | EventKind::RateLimitExceeded
            | EventKind::RequestTooLarge
            | EventKind::MalformedRequest
            | EventKind::RequestTimeout
            | EventKind::CorsBlocked
            | EventKind::InsecureRequest
            | EventKind::CloudflareSpoof => Severity::Warn,
            EventKind::PanicRecovered | EventKind::UpstreamFailed => Severity::Error,
        }
    }

    /// Human-readable message.
    pub fn message(self) -> &'static str {
        match self {
            EventKind::RequestStarted => "Incoming request",
            EventKind::RequestCompleted => "Request completed",
            EventKind::LateResponseDiscarded => "Response discarded, timeout already answered",
            EventKind::RateLimitExceeded => "Rate limit exceeded for IP",
            EventKind::BucketsEvicted => "Evicted idle rate limit buckets",
            EventKind::RequestTooLarge => "Request body too large",
            EventKind::MalformedRequest => "Malformed request body",
            EventKind::RequestTimeout => "Request timeout",
            EventKind::PanicRecovered => "Panic recovered",
            EventKind::CorsBlocked => "CORS request blocked",
            EventKind::InsecureRequest => "Insecure HTTP request in production",
            EventKind::CloudflareSpoof => "Spoofed Cloudflare headers detected",
            EventKind::RouteNotFound => "No route matches request path",
            EventKind::UpstreamFailed => "Upstream request failed",
        }
    }
}

/// A single reported event with its key/value fields.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub severity: Severity,
    pub fields: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            fields: Vec::new(),
        }
    }

    /// Override the default severity.
    pub fn at(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach a field.
    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// Attach the request id and client IP of a request context.
    pub fn with_context(self, ctx: &RequestContext) -> Self {
        self.with("request_id", ctx.request_id())
            .with("client_ip", ctx.client_ip())
    }

    /// Look up a field value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Renders fields as `key=value` pairs for a single tracing field.
struct Fields<'a>(&'a [(&'static str, String)]);

impl fmt::Display for Fields<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Logger capability injected into every pipeline stage.
pub trait EventLogger: Send + Sync + 'static {
    fn log(&self, event: Event);
}

/// Shared handle to the injected logger.
pub type SharedLogger = Arc<dyn EventLogger>;

/// Production logger: emits each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn shared() -> SharedLogger {
        Arc::new(Self)
    }
}

impl EventLogger for TracingLogger {
    fn log(&self, event: Event) {
        let component = event.kind.component();
        let message = event.kind.message();
        let fields = Fields(&event.fields);

        match event.severity {
            Severity::Debug => debug!(component, fields = %fields, "{message}"),
            Severity::Info => info!(component, fields = %fields, "{message}"),
            Severity::Warn => warn!(component, fields = %fields, "{message}"),
            Severity::Error => error!(component, fields = %fields, "{message}"),
        }
    }
}

/// In-memory logger that keeps every event, for tests and embedders that
/// want to inspect what the pipeline reported.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<Event>>,
}

impl MemoryLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of recorded events of `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventLogger for MemoryLogger {
    fn log(&self, event: Event) {
        self.events.lock().push(event);
    }
}
