//! HTTP middleware stages of the gateway pipeline.
//!
//! Each stage is a Tower `Layer`/`Service` pair. [`crate::pipeline`] stacks
//! them in a fixed order:
//!
//! ```text
//! Request → Recovery → Request ID → IP → [Cloudflare] → Timeout → Body Limit
//!         → CORS + Security Headers → [Rate Limit] → Compression → Logging → Router
//!              ↓          ↓                              ↓          ↓            ↓
//!             500     X-Request-ID                      504        413/400      429
//! ```
//!
//! - **Recovery**: catches panics anywhere below and answers one generic 500
//! - **Request ID**: correlation id propagation and the per-request span
//! - **IP extraction**: builds the typed `RequestContext`
//! - **Cloudflare validation**: reports spoofed Cloudflare headers (optional)
//! - **Timeout**: deadline with cooperative cancellation of downstream work
//! - **Body limit**: `Content-Length` checks and a length-limited body
//! - **CORS / security headers**: origin policy and OWASP response headers
//! - **Rate limiting**: per-IP token buckets (skipped when disabled)
//! - **Logging**: completion logging and the write-once status capture

pub mod body_limit;
pub mod capture;
pub mod ip;
pub mod logging;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod security;
pub mod timeout;

pub use body_limit::BodyLimitLayer;
pub use capture::ResponseCapture;
pub use ip::{CloudflareValidationLayer, IpExtractionLayer, UNKNOWN_IP, extract_client_ip};
pub use logging::LoggingLayer;
pub use rate_limit::{
    PerIpRateLimiter, RateLimitConfig, RateLimitDecision, RateLimitError, RateLimitLayer,
};
pub use recovery::RecoveryLayer;
pub use request_id::RequestIdLayer;
pub use security::{OriginPolicy, SecurityHeadersLayer, cors_layer};
pub use timeout::TimeoutLayer;
