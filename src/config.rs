//! Gateway configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! Everything is read from environment variables (or a `.env` file). The
//! `ENVIRONMENT` variable is read first because it selects the defaults for
//! CORS and rate limiting:
//!
//! | Setting | development | production |
//! |---------|-------------|------------|
//! | `CORS_ALLOWED_ORIGINS` | `*` | `http://localhost:3000,http://localhost:8080` |
//! | `RATE_LIMIT_REFILL_PER_SEC` | 1000 | 100 |
//! | `RATE_LIMIT_CAPACITY` | 2000 | 200 |
//!
//! # Routes
//!
//! - `GATEWAY_ROUTES`: comma-separated `prefix=target` pairs, e.g.
//!   `/service-a/=http://service-a:8080,/service-b/=http://service-b:8081`
//! - `GATEWAY_ROUTES_FILE`: path to a JSON array of
//!   `{"prefix": "...", "target_url": "..."}` objects, appended after
//!   `GATEWAY_ROUTES`
//!
//! # Request Limits
//!
//! - `REQUEST_TIMEOUT_MS`: total per-request deadline (default: 10000)
//! - `MAX_BODY_BYTES`: maximum request body (default: 10MB)
//! - `RATE_LIMIT_REFILL_PER_SEC`: steady-state requests/sec per IP (0 disables)
//! - `RATE_LIMIT_CAPACITY`: per-IP burst size
//! - `RATE_LIMIT_MAX_TRACKED_IPS`, `RATE_LIMIT_IDLE_TTL_SECS`,
//!   `RATE_LIMIT_SWEEP_INTERVAL_SECS`: bucket eviction

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};
use crate::proxy::ProxyRoute;

/// Deployment environment; selects defaults and production-only checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => f.write_str("development"),
            Environment::Production => f.write_str("production"),
        }
    }
}

/// Gateway configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8082)
    pub port: u16,

    /// Deployment environment (default: development)
    pub environment: Environment,

    // =========================================================================
    // Routing
    // =========================================================================
    /// Prefix routes to backend base URLs, in declaration order
    pub routes: Vec<ProxyRoute>,

    // =========================================================================
    // Request Limits
    // =========================================================================
    /// Deadline for the whole downstream chain of one request
    pub request_timeout: Duration,

    /// Maximum request body size in bytes
    pub max_body_bytes: usize,

    /// Allowed CORS origins; `*` and `*.domain` wildcards are supported
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Rate Limiting
    // =========================================================================
    /// Maximum burst per client IP (bucket capacity)
    pub rate_limit_capacity: u32,

    /// Tokens added per second per client IP. 0 disables rate limiting.
    pub rate_limit_refill_per_sec: f64,

    /// Upper bound on the number of client IPs tracked at once
    pub rate_limit_max_tracked_ips: usize,

    /// Buckets not touched for this long are evicted
    pub rate_limit_idle_ttl: Duration,

    /// How often the background sweeper looks for idle buckets
    pub rate_limit_sweep_interval: Duration,

    // =========================================================================
    // Upstream Transport
    // =========================================================================
    /// Connect (including TLS handshake) timeout for backend connections
    pub upstream_connect_timeout: Duration,

    /// How long an idle pooled backend connection is kept
    pub upstream_pool_idle_timeout: Duration,

    /// Maximum idle pooled connections per backend host
    pub upstream_pool_max_idle_per_host: usize,

    // =========================================================================
    // Client IP / Security
    // =========================================================================
    /// Validate requests carrying Cloudflare headers against Cloudflare's ranges
    pub use_cloudflare: bool,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter (e.g., "info", "edge_gateway=debug")
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text
    pub log_json: bool,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if any value fails to parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let environment: Environment = Self::parse_env("ENVIRONMENT", Environment::Development)?;
        let (default_rps, default_burst) = match environment {
            Environment::Development => (1000.0, 2000),
            Environment::Production => (100.0, 200),
        };

        let mut routes = Self::parse_routes(&env::var("GATEWAY_ROUTES").unwrap_or_default())?;
        if let Ok(path) = env::var("GATEWAY_ROUTES_FILE")
            && !path.trim().is_empty()
        {
            routes.extend(Self::load_routes_file(path.trim())?);
        }

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8082)?,
            environment,

            // Routing
            routes,

            // Request limits
            request_timeout: Duration::from_millis(Self::parse_env("REQUEST_TIMEOUT_MS", 10_000)?),
            max_body_bytes: Self::parse_env("MAX_BODY_BYTES", 10 * 1024 * 1024)?, // 10MB
            cors_allowed_origins: Self::parse_cors_origins(environment),

            // Rate limiting
            rate_limit_capacity: Self::parse_env("RATE_LIMIT_CAPACITY", default_burst)?,
            rate_limit_refill_per_sec: Self::parse_env("RATE_LIMIT_REFILL_PER_SEC", default_rps)?,
            rate_limit_max_tracked_ips: Self::parse_env("RATE_LIMIT_MAX_TRACKED_IPS", 100_000)?,
            rate_limit_idle_ttl: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_IDLE_TTL_SECS",
                600,
            )?),
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                60,
            )?),

            // Upstream transport
            upstream_connect_timeout: Duration::from_millis(Self::parse_env(
                "UPSTREAM_CONNECT_TIMEOUT_MS",
                10_000,
            )?),
            upstream_pool_idle_timeout: Duration::from_secs(Self::parse_env(
                "UPSTREAM_POOL_IDLE_TIMEOUT_SECS",
                90,
            )?),
            upstream_pool_max_idle_per_host: Self::parse_env(
                "UPSTREAM_POOL_MAX_IDLE_PER_HOST",
                100,
            )?,

            // Client IP / security
            use_cloudflare: Self::parse_env("USE_CLOUDFLARE", false)?,

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if validation fails.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.request_timeout.is_zero() {
            return Err(GatewayError::ConfigError(
                "REQUEST_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_body_bytes == 0 {
            return Err(GatewayError::ConfigError(
                "MAX_BODY_BYTES must be greater than 0".to_string(),
            ));
        }

        if !self.rate_limit_refill_per_sec.is_finite() || self.rate_limit_refill_per_sec < 0.0 {
            return Err(GatewayError::ConfigError(format!(
                "RATE_LIMIT_REFILL_PER_SEC must be a non-negative number, got {}",
                self.rate_limit_refill_per_sec
            )));
        }

        if self.rate_limiting_enabled() {
            if self.rate_limit_capacity == 0 {
                return Err(GatewayError::ConfigError(
                    "RATE_LIMIT_CAPACITY must be at least 1 when rate limiting is enabled"
                        .to_string(),
                ));
            }
            if self.rate_limit_max_tracked_ips == 0 {
                return Err(GatewayError::ConfigError(
                    "RATE_LIMIT_MAX_TRACKED_IPS must be greater than 0".to_string(),
                ));
            }
            if self.rate_limit_sweep_interval.is_zero() {
                return Err(GatewayError::ConfigError(
                    "RATE_LIMIT_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
                ));
            }
        }

        for (i, route) in self.routes.iter().enumerate() {
            route.validate()?;
            if self.routes[..i].iter().any(|r| r.prefix == route.prefix) {
                return Err(GatewayError::ConfigError(format!(
                    "Duplicate route prefix '{}'",
                    route.prefix
                )));
            }
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_refill_per_sec > 0.0
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| GatewayError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse `prefix=target` pairs separated by commas.
    pub fn parse_routes(raw: &str) -> GatewayResult<Vec<ProxyRoute>> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (prefix, target) = entry.split_once('=').ok_or_else(|| {
                    GatewayError::ConfigError(format!(
                        "Invalid GATEWAY_ROUTES entry '{entry}', expected prefix=target"
                    ))
                })?;
                Ok(ProxyRoute::new(prefix.trim(), target.trim()))
            })
            .collect()
    }

    fn load_routes_file(path: &str) -> GatewayResult<Vec<ProxyRoute>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!("Cannot read GATEWAY_ROUTES_FILE '{path}': {e}"))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GatewayError::ConfigError(format!("Invalid GATEWAY_ROUTES_FILE '{path}': {e}"))
        })
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins(environment: Environment) -> Vec<String> {
        let default = match environment {
            Environment::Development => "*",
            Environment::Production => "http://localhost:3000,http://localhost:8080",
        };
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8082,
            environment: Environment::Development,
            // Routing
            routes: Vec::new(),
            // Request limits
            request_timeout: Duration::from_secs(10),
            max_body_bytes: 10 * 1024 * 1024, // 10MB
            cors_allowed_origins: vec!["*".to_string()],
            // Rate limiting
            rate_limit_capacity: 2000,
            rate_limit_refill_per_sec: 1000.0,
            rate_limit_max_tracked_ips: 100_000,
            rate_limit_idle_ttl: Duration::from_secs(600),
            rate_limit_sweep_interval: Duration::from_secs(60),
            // Upstream transport
            upstream_connect_timeout: Duration::from_secs(10),
            upstream_pool_idle_timeout: Duration::from_secs(90),
            upstream_pool_max_idle_per_host: 100,
            // Client IP / security
            use_cloudflare: false,
            // Observability
            log_level: "info".to_string(),
            log_json: false,
            metrics_port: 9090,
        }
    }
}
