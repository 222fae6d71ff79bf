//! Shared gateway state.
//!
//! Everything built once at startup and shared by every request:
//!
//! - **Configuration**: runtime configuration access
//! - **Logger**: the [`SharedLogger`] injected into every pipeline stage
//! - **Rate limiter**: per-IP buckets, `None` when rate limiting is disabled
//! - **Proxy**: the forwarder with its pooled backend client
//!
//! # Structured Concurrency
//!
//! The idle-bucket sweeper runs on a `tokio_util::task::TaskTracker` and
//! stops on a `CancellationToken`. Call `shutdown()` to stop it before the
//! process exits.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::events::SharedLogger;
use crate::middleware::{PerIpRateLimiter, RateLimitConfig};
use crate::proxy::ProxyService;

/// Shared gateway state. Cloning is cheap; every field is shared.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config, TracingLogger::shared())?;
/// // ... serve ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Logger handed to every pipeline stage
    pub logger: SharedLogger,
    /// Per-IP limiter, absent when rate limiting is disabled
    pub rate_limiter: Option<Arc<PerIpRateLimiter>>,
    /// Reverse proxy forwarder
    pub proxy: ProxyService,
    /// Timestamp when the gateway started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state and start the background sweeper.
    ///
    /// Must be called inside a Tokio runtime when rate limiting is enabled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if the routes, the rate limiter
    /// settings or the upstream client are invalid.
    pub fn new(config: Config, logger: SharedLogger) -> GatewayResult<Self> {
        let proxy = ProxyService::from_config(&config, logger.clone())?;

        let rate_limiter = if config.rate_limiting_enabled() {
            let limiter = PerIpRateLimiter::new(RateLimitConfig::from_config(&config), logger.clone())
                .map_err(|e| GatewayError::ConfigError(format!("Invalid rate limit settings: {e}")))?;
            Some(Arc::new(limiter))
        } else {
            None
        };

        let state = Self {
            config: Arc::new(config),
            logger,
            rate_limiter,
            proxy,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_background_tasks();

        Ok(state)
    }

    fn spawn_background_tasks(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.spawn_sweeper(
                &self.task_tracker,
                self.cancellation_token.clone(),
                self.config.rate_limit_sweep_interval,
            );
        }
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Signals the tasks, closes the tracker and waits for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the gateway uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
