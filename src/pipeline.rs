//! Middleware chain assembly.
//!
//! The order of the stages is fixed and numbered. Moving a stage changes
//! observable behaviour (which stages see a panic, whether a 429 carries a
//! request id, what the timeout covers), so the chain is built in exactly
//! one place:
//!
//! ```text
//!  1. Recovery                  outermost, catches panics from everything below
//!  2. Request ID / tracer       X-Request-ID, request span
//!  3. IP extraction             RequestContext
//!  3a. Cloudflare validation    optional
//!  4. Timeout                   deadline + cooperative cancellation
//!  5. Body limit                413 / 400
//!  6. CORS + security headers
//!  7. Rate limiting             skipped entirely when disabled
//!  8. Compression               gzip by Accept-Encoding
//!  9. Logging                   completion log, ResponseCapture
//! 10. Inner service             router (health + reverse proxy)
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder};
use tower_http::compression::{CompressionBody, CompressionLayer};

use crate::config::Config;
use crate::events::SharedLogger;
use crate::middleware::{
    BodyLimitLayer, CloudflareValidationLayer, IpExtractionLayer, LoggingLayer, PerIpRateLimiter,
    RateLimitLayer, RecoveryLayer, RequestIdLayer, SecurityHeadersLayer, TimeoutLayer, cors_layer,
};

/// The assembled pipeline: one boxed, cloneable, shareable service.
pub type Pipeline = BoxCloneSyncService<Request<Body>, Response<Body>, Infallible>;

/// Builder for the ordered middleware chain.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = MiddlewareChain::from_config(&config, logger, limiter)
///     .build(proxy_service);
/// let app = Router::new().fallback_service(pipeline);
/// ```
#[derive(Clone)]
pub struct MiddlewareChain {
    logger: SharedLogger,
    request_timeout: Duration,
    max_body_bytes: usize,
    cors_origins: Vec<String>,
    production: bool,
    cloudflare: bool,
    rate_limiter: Option<Arc<PerIpRateLimiter>>,
}

impl MiddlewareChain {
    /// Chain with development defaults: 10s timeout, 10MB bodies, any
    /// origin, no rate limiting, no Cloudflare validation.
    pub fn new(logger: SharedLogger) -> Self {
        Self {
            logger,
            request_timeout: Duration::from_secs(10),
            max_body_bytes: 10 * 1024 * 1024,
            cors_origins: vec!["*".to_string()],
            production: false,
            cloudflare: false,
            rate_limiter: None,
        }
    }

    pub fn from_config(
        config: &Config,
        logger: SharedLogger,
        rate_limiter: Option<Arc<PerIpRateLimiter>>,
    ) -> Self {
        Self {
            logger,
            request_timeout: config.request_timeout,
            max_body_bytes: config.max_body_bytes,
            cors_origins: config.cors_allowed_origins.clone(),
            production: config.is_production(),
            cloudflare: config.use_cloudflare,
            rate_limiter,
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    pub fn production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn cloudflare_validation(mut self, enabled: bool) -> Self {
        self.cloudflare = enabled;
        self
    }

    /// `None` leaves the rate limiting stage out of the chain.
    pub fn rate_limiter(mut self, limiter: Option<Arc<PerIpRateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Wrap `inner` in every stage, outermost first.
    pub fn build<S>(&self, inner: S) -> Pipeline
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let logger = &self.logger;

        let cloudflare = self
            .cloudflare
            .then(|| CloudflareValidationLayer::new(logger.clone()));
        let rate_limit = self
            .rate_limiter
            .clone()
            .map(|limiter| RateLimitLayer::new(limiter, logger.clone()));

        let service = ServiceBuilder::new()
            // 1
            .layer(RecoveryLayer::new(logger.clone()))
            // 2
            .layer(RequestIdLayer::new())
            // 3, 3a
            .layer(IpExtractionLayer::new())
            .option_layer(cloudflare)
            // 4
            .layer(TimeoutLayer::new(self.request_timeout, logger.clone()))
            // 5
            .layer(BodyLimitLayer::new(self.max_body_bytes, logger.clone()))
            // 6
            .layer(cors_layer(&self.cors_origins, logger.clone()))
            .layer(SecurityHeadersLayer::new(self.production, logger.clone()))
            // 7
            .option_layer(rate_limit)
            // 8
            .map_response(|resp: Response<CompressionBody<Body>>| resp.map(Body::new))
            .layer(CompressionLayer::new())
            // 9
            .layer(LoggingLayer::new(logger.clone()))
            // 10
            .service(inner);

        BoxCloneSyncService::new(service)
    }
}
