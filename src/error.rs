use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error types with appropriate HTTP status codes.
///
/// Every failure detected by a pipeline stage is resolved into exactly one of
/// these variants and converted to a response at that stage. Nothing is
/// allowed to travel past the recovery stage unconverted.
///
/// # Client vs. Server Errors
///
/// - 4xx variants describe problems with the inbound request. They are
///   reported to the caller and logged at `warn`/`info`.
/// - 5xx variants describe gateway or backend failures. They are logged at
///   `error` with the full request context by the stage that produced them.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("No route matches path: {0}")]
    RouteNotFound(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Backend unreachable: {0}")]
    BadGateway(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request cancelled before the backend answered")]
    Cancelled,

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body returned to callers.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: &'static str,
}

impl GatewayError {
    /// HTTP status this error resolves to.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) | GatewayError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) | GatewayError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable kind, used in bodies and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::RouteNotFound(_) => "not_found",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::BadGateway(_) => "bad_gateway",
            GatewayError::Timeout(_) | GatewayError::Cancelled => "gateway_timeout",
            GatewayError::Internal(_) => "internal_error",
            GatewayError::ConfigError(_) => "config_error",
        }
    }

    /// Client-facing message. Never includes backend addresses or internals.
    fn public_message(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "The request could not be read.",
            GatewayError::RouteNotFound(_) => "No service is configured for this path.",
            GatewayError::PayloadTooLarge { .. } => "Request body too large.",
            GatewayError::RateLimited { .. } => "Too many requests. Please retry later.",
            GatewayError::BadGateway(_) => {
                "The upstream service is unavailable. Please try again later."
            }
            GatewayError::Timeout(_) | GatewayError::Cancelled => {
                "The upstream service did not respond in time."
            }
            GatewayError::Internal(_) => {
                "An internal error occurred. Please contact support if the issue persists."
            }
            GatewayError::ConfigError(_) => "Gateway configuration error. Please contact support.",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Stages log with request context before converting; this only
        // records the conversion itself.
        tracing::debug!(error = %self, "Resolving error to response");

        let body = ErrorResponse {
            error: self.kind(),
            message: self.public_message(),
        };

        (self.status(), axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::PayloadTooLarge { limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::BadGateway("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(GatewayError::Cancelled.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::RouteNotFound("/x".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_error_body_does_not_leak_details() {
        let response =
            GatewayError::BadGateway("connect to 10.1.2.3:8080 refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "bad_gateway");
        assert!(!body.windows(8).any(|w| w == b"10.1.2.3"));
    }
}
