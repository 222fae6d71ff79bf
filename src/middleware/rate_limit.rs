//! Per-IP rate limiting using a lazily refilled token bucket.
//!
//! # Algorithm
//!
//! Each client IP owns a bucket of `capacity` tokens. On every request the
//! bucket is topped up by `elapsed * refill_per_sec` (never above capacity),
//! then one token is consumed if at least one is available. Refill happens
//! only when the bucket is touched, so idle clients cost nothing.
//!
//! All buckets live in one map behind a single `parking_lot::Mutex`; the
//! critical section is a hash lookup plus a few float operations.
//!
//! # Memory Bound
//!
//! - A background sweeper (see [`PerIpRateLimiter::spawn_sweeper`]) evicts
//!   buckets idle longer than `idle_ttl`.
//! - When the map holds `max_tracked_ips` entries and a new IP arrives, idle
//!   buckets are purged first, then the least-recently-seen 1/64th of the map
//!   (at least one bucket) is evicted.
//!
//! # Response Headers
//!
//! On every request that reaches this stage:
//! - `X-RateLimit-Limit`: bucket capacity
//! - `X-RateLimit-Remaining`: whole tokens left after this request
//!
//! On rate limit exceeded (429), additionally:
//! - `Retry-After`: seconds until one token is available (at least 1)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use parking_lot::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::debug;

use super::ip::extract_client_ip;
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::GatewayError;
use crate::events::{Event, EventKind, SharedLogger};
use crate::metrics;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// A full map sheds `max_tracked_ips / EVICTION_BATCH_DIVISOR` buckets at once.
const EVICTION_BATCH_DIVISOR: usize = 64;

/// Error type for rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// Capacity must hold at least one token.
    ZeroCapacity,
    /// Refill rate must be a positive, finite number.
    InvalidRefillRate,
    /// At least one IP must be trackable.
    ZeroTrackedIps,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::ZeroCapacity => write!(f, "bucket capacity must be at least 1"),
            RateLimitError::InvalidRefillRate => {
                write!(f, "refill rate must be positive; skip the layer for no limiting")
            }
            RateLimitError::ZeroTrackedIps => write!(f, "max tracked IPs must be greater than 0"),
        }
    }
}

impl std::error::Error for RateLimitError {}

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum burst (tokens in a full bucket)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Upper bound on concurrently tracked IPs
    pub max_tracked_ips: usize,
    /// Buckets untouched for this long are evicted
    pub idle_ttl: Duration,
}

impl RateLimitConfig {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            max_tracked_ips: 100_000,
            idle_ttl: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.rate_limit_capacity,
            refill_per_sec: config.rate_limit_refill_per_sec,
            max_tracked_ips: config.rate_limit_max_tracked_ips,
            idle_ttl: config.rate_limit_idle_ttl,
        }
    }
}

/// Outcome of a single [`PerIpRateLimiter::allow`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    pub fn remaining(&self) -> u32 {
        match self {
            RateLimitDecision::Allowed { remaining } => *remaining,
            RateLimitDecision::Limited { .. } => 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Token buckets for every client IP seen recently.
pub struct PerIpRateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    logger: SharedLogger,
}

impl PerIpRateLimiter {
    /// # Errors
    ///
    /// Returns a [`RateLimitError`] for a zero capacity, a non-positive or
    /// non-finite refill rate, or a zero IP bound.
    pub fn new(config: RateLimitConfig, logger: SharedLogger) -> Result<Self, RateLimitError> {
        if config.capacity == 0 {
            return Err(RateLimitError::ZeroCapacity);
        }
        if !config.refill_per_sec.is_finite() || config.refill_per_sec <= 0.0 {
            return Err(RateLimitError::InvalidRefillRate);
        }
        if config.max_tracked_ips == 0 {
            return Err(RateLimitError::ZeroTrackedIps);
        }

        Ok(Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            logger,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    /// Take one token from `ip`'s bucket if available.
    pub fn allow(&self, ip: &str) -> RateLimitDecision {
        self.allow_at(ip, Instant::now())
    }

    /// [`allow`](Self::allow) against an explicit clock reading.
    pub fn allow_at(&self, ip: &str, now: Instant) -> RateLimitDecision {
        let capacity = f64::from(self.config.capacity);
        let rate = self.config.refill_per_sec;

        let mut buckets = self.buckets.lock();

        let mut evicted = 0;
        if !buckets.contains_key(ip) && buckets.len() >= self.config.max_tracked_ips {
            evicted = self.make_room(&mut buckets, now);
        }

        let bucket = buckets
            .entry(ip.to_string())
            .or_insert_with(|| Bucket::full(capacity, now));
        bucket.refill(capacity, rate, now);
        bucket.last_seen = now;

        let decision = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision::Allowed {
                remaining: bucket.tokens as u32,
            }
        } else {
            let wait = ((1.0 - bucket.tokens) / rate).ceil() as u64;
            RateLimitDecision::Limited {
                retry_after_secs: wait.max(1),
            }
        };
        let tracked = buckets.len();
        drop(buckets);

        if evicted > 0 {
            self.report_eviction(evicted, tracked, "capacity");
        }
        metrics::set_tracked_ips(tracked);

        decision
    }

    /// Purge idle buckets, then the least-recently-seen batch if still full.
    ///
    /// Each full scan frees at least [`eviction_batch`](Self::eviction_batch)
    /// slots, so a flood of new IPs pays for one scan per batch.
    fn make_room(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) -> usize {
        let before = buckets.len();
        let ttl = self.config.idle_ttl;
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < ttl);

        if buckets.len() >= self.config.max_tracked_ips {
            let batch = self.eviction_batch().min(buckets.len());
            let oldest: Vec<String> = {
                let mut by_age: Vec<(Instant, &String)> =
                    buckets.iter().map(|(ip, b)| (b.last_seen, ip)).collect();
                by_age.select_nth_unstable_by_key(batch - 1, |(seen, _)| *seen);
                by_age[..batch].iter().map(|(_, ip)| (*ip).clone()).collect()
            };

            for ip in &oldest {
                buckets.remove(ip);
            }
        }

        before - buckets.len()
    }

    /// Buckets dropped at once when the map is full of active IPs.
    fn eviction_batch(&self) -> usize {
        (self.config.max_tracked_ips / EVICTION_BATCH_DIVISOR).max(1)
    }

    /// Evict every bucket idle for longer than the configured TTL.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl;
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < ttl);
        let evicted = before - buckets.len();
        let tracked = buckets.len();
        drop(buckets);

        if evicted > 0 {
            self.report_eviction(evicted, tracked, "idle");
        }
        metrics::set_tracked_ips(tracked);
        evicted
    }

    fn report_eviction(&self, evicted: usize, tracked: usize, reason: &'static str) {
        self.logger.log(
            Event::new(EventKind::BucketsEvicted)
                .with("evicted", evicted)
                .with("tracked_ips", tracked)
                .with("reason", reason),
        );
    }

    /// Number of IPs currently holding a bucket.
    pub fn tracked_ips(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Tokens stored for `ip` as of its last request, if tracked.
    pub fn tokens(&self, ip: &str) -> Option<f64> {
        self.buckets.lock().get(ip).map(|b| b.tokens)
    }

    /// Spawn the idle-bucket sweeper on `tracker`, stopped by `cancel`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        every: Duration,
    ) {
        let limiter = Arc::clone(self);

        tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate limit sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        limiter.evict_idle();
                    }
                }
            }

            debug!("Rate limit sweeper shutting down");
        });
    }
}

/// Rate limiting layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(PerIpRateLimiter::new(RateLimitConfig::new(200, 100.0), logger.clone())?);
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(RateLimitLayer::new(limiter, logger));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<PerIpRateLimiter>,
    logger: SharedLogger,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<PerIpRateLimiter>, logger: SharedLogger) -> Self {
        Self { limiter, logger }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            logger: self.logger.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<PerIpRateLimiter>,
    logger: SharedLogger,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let ctx = req.extensions().get::<RequestContext>().cloned();
        let client_ip = match &ctx {
            Some(ctx) => ctx.client_ip().to_string(),
            None => extract_client_ip(&req).into_owned(),
        };

        let decision = self.limiter.allow(&client_ip);
        let limit = HeaderValue::from(self.limiter.capacity());
        let remaining = HeaderValue::from(decision.remaining());

        if let RateLimitDecision::Limited { retry_after_secs } = decision {
            let mut event = Event::new(EventKind::RateLimitExceeded)
                .with("client_ip", &client_ip)
                .with("method", req.method())
                .with("path", req.uri().path())
                .with("retry_after_secs", retry_after_secs);
            if let Some(ctx) = &ctx {
                event = event.with("request_id", ctx.request_id());
            }
            self.logger.log(event);
            metrics::record_rate_limited();

            let mut response = GatewayError::RateLimited { retry_after_secs }.into_response();
            let headers = response.headers_mut();
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            headers.insert(RATE_LIMIT_LIMIT_HEADER, limit);
            headers.insert(RATE_LIMIT_REMAINING_HEADER, remaining);

            return Box::pin(async move { Ok(response) });
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT_HEADER, limit);
            headers.insert(RATE_LIMIT_REMAINING_HEADER, remaining);
            Ok(response)
        })
    }
}
