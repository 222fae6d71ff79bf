//! Gateway routing.
//!
//! # Layout
//!
//! ```text
//! Router (outer)
//!    │  fallback
//!    ▼
//! Pipeline (MiddlewareChain, stages 1-9)
//!    │
//!    ▼
//! Router (inner)
//!    ├── GET /health   → handlers::health_check
//!    └── fallback      → ProxyService (prefix routes)
//! ```
//!
//! The outer router only hosts the pipeline so the whole chain, including
//! recovery and the tracer, sees every request, health checks and unknown
//! paths included. Serve it with
//! `into_make_service_with_connect_info::<SocketAddr>()` so the peer address
//! is available to IP extraction.

use axum::Router;
use axum::routing::get;
use tracing::info;

use crate::handlers;
use crate::pipeline::MiddlewareChain;
use crate::state::AppState;

/// Build the gateway router with the full middleware chain configured.
pub fn build_router(state: &AppState) -> Router {
    let config = &state.config;

    info!(
        routes = state.proxy.routes().len(),
        timeout_ms = config.request_timeout.as_millis() as u64,
        max_body_mb = config.max_body_bytes / (1024 * 1024),
        "Building gateway pipeline"
    );
    for route in state.proxy.routes().routes() {
        info!(prefix = %route.prefix, target = %route.target_base_url, "Route configured");
    }

    match &state.rate_limiter {
        Some(limiter) => info!(
            capacity = limiter.capacity(),
            refill_per_sec = config.rate_limit_refill_per_sec,
            max_tracked_ips = config.rate_limit_max_tracked_ips,
            "Rate limiting enabled"
        ),
        None => info!("Rate limiting disabled (RATE_LIMIT_REFILL_PER_SEC=0)"),
    }
    if config.use_cloudflare {
        info!("Cloudflare header validation enabled");
    }

    let pipeline = MiddlewareChain::from_config(config, state.logger.clone(), state.rate_limiter.clone())
        .build(inner_router(state));

    Router::new().fallback_service(pipeline)
}

/// Health endpoint plus the reverse proxy for everything else.
pub fn inner_router(state: &AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .fallback_service(state.proxy.clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{EventKind, MemoryLogger};
    use crate::proxy::ProxyRoute;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_with_routes_serves_health_and_unknown_paths() {
        let config = Config {
            routes: vec![
                ProxyRoute::new("/service-a/", "http://service-a:8080"),
                ProxyRoute::new("/service-b/", "http://service-b:8081"),
            ],
            rate_limit_refill_per_sec: 0.0,
            metrics_port: 0,
            ..Config::default()
        };
        let logger = MemoryLogger::new();
        let state = AppState::new(config, logger.clone()).unwrap();
        let app = build_router(&state);

        let health = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let missing = app
            .oneshot(Request::builder().uri("/nowhere").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(logger.count(EventKind::RouteNotFound), 1);

        state.shutdown().await;
    }
}
