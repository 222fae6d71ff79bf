//! # Edge Gateway
//!
//! An HTTP edge gateway: an ordered middleware pipeline in front of a
//! prefix-routed reverse proxy, featuring:
//!
//! - **Resilience**: panic recovery, per-request deadlines with cooperative
//!   cancellation of backend calls
//! - **Protection**: per-IP token bucket rate limiting, body size limits,
//!   CORS and security headers
//! - **Observability**: correlation ids, per-request spans, structured
//!   events, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Recovery → Request ID → IP → Timeout → Body Limit          │
//! │  → CORS/Security → Rate Limit → Compression → Logging       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  /health            │  ProxyService (longest-prefix routes) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends (pooled reqwest client)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use edge_gateway::{AppState, Config, TracingLogger, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config.clone(), TracingLogger::shared())?;
//!     let app = build_router(&state);
//!
//!     let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Routes
//!
//! ```bash
//! GATEWAY_ROUTES=/service-a/=http://service-a:8080,/service-b/=http://service-b:8081 cargo run
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod proxy;
pub mod routes;
pub mod state;

// Re-exports for convenience
pub use config::{Config, Environment};
pub use context::{Cancellation, RequestContext, RequestId, RequestScope};
pub use error::{GatewayError, GatewayResult};
pub use events::{Event, EventKind, EventLogger, MemoryLogger, SharedLogger, TracingLogger};
pub use pipeline::{MiddlewareChain, Pipeline};
pub use proxy::{ProxyRoute, ProxyService, RouteTable};
pub use routes::build_router;
pub use state::AppState;
