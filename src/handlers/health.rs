//! Gateway health endpoint.
//!
//! `GET /health` runs through every pipeline stage (it gets a request id,
//! security headers and rate limit headers like any other request) but is
//! answered by the gateway itself and never forwarded.

use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

/// Health check response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint.
///
/// Always returns 200 OK while the process is serving.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "ok",
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}
