//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//! The pipeline settings are resolved once into an immutable [`PipelineOptions`]
//! snapshot shared by every request.
//!
//! # Pipeline
//!
//! - `RATE_LIMIT_WINDOW_MS`: Length of a counting window (default: 60000, max: one year)
//! - `RATE_LIMIT_MAX_KEYS`: Maximum clients tracked at once (default: 1000000)
//! - `RATE_LIMIT_REQUESTS`: Requests admitted per client per window (default: 1000, 0 = disabled)
//! - `REQUEST_TIMEOUT_MS`: Deadline for the downstream handler (default: 60000)
//! - `TRACKING_HEADER`: Correlation id header (default: `X-Request-ID`)
//! - `TIMING_HEADER`: Elapsed time header (default: `X-Response-Time`)
//! - `STATE_NAMESPACE`: Namespace recorded on every request span (default: `state`)
//!
//! # Security Configuration
//!
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarding headers are honored

use std::env;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;

use crate::error::{AppError, AppResult};

/// Default window length.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;
/// Longest accepted window (one year).
pub const MAX_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;
/// Default number of tracked clients.
pub const DEFAULT_MAX_KEYS: usize = 1_000_000;
/// Default requests per client per window.
pub const DEFAULT_REQUESTS_PER_WINDOW: u64 = 1_000;
/// Default handler deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Default correlation id header.
pub const DEFAULT_TRACKING_HEADER: &str = "x-request-id";
/// Default elapsed time header.
pub const DEFAULT_TIMING_HEADER: &str = "x-response-time";
/// Default span namespace.
pub const DEFAULT_NAMESPACE: &str = "state";

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Length of one counting window.
    pub window: Duration,
    /// Maximum number of clients tracked at once.
    pub max_keys: usize,
    /// Requests admitted per client per window (0 = rate limiting disabled).
    pub requests_per_window: u64,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_WINDOW_MS),
            max_keys: DEFAULT_MAX_KEYS,
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
        }
    }
}

impl RateLimitOptions {
    /// Check if rate limiting is enabled.
    pub fn enabled(&self) -> bool {
        self.requests_per_window > 0
    }
}

/// Names of the headers the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNames {
    /// Correlation id, read from requests and echoed on responses.
    pub tracking: HeaderName,
    /// Elapsed handling time on responses.
    pub timing: HeaderName,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            tracking: HeaderName::from_static(DEFAULT_TRACKING_HEADER),
            timing: HeaderName::from_static(DEFAULT_TIMING_HEADER),
        }
    }
}

/// Immutable pipeline configuration, resolved once at layer construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub rate_limit: RateLimitOptions,
    /// Deadline for the downstream handler.
    pub timeout: Duration,
    pub headers: HeaderNames,
    /// Recorded on every request span to tell pipelines apart in shared logs.
    pub namespace: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitOptions::default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            headers: HeaderNames::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl PipelineOptions {
    /// Validate values that would make the pipeline unusable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` naming the offending setting.
    pub fn validate(&self) -> AppResult<()> {
        if self.rate_limit.window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_MS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.window > Duration::from_millis(MAX_WINDOW_MS) {
            return Err(AppError::ConfigError(format!(
                "RATE_LIMIT_WINDOW_MS must be at most {MAX_WINDOW_MS}"
            )));
        }

        if self.rate_limit.max_keys == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_MAX_KEYS must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(AppError::ConfigError(
                "REQUEST_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.headers.tracking == self.headers.timing {
            return Err(AppError::ConfigError(
                "TRACKING_HEADER and TIMING_HEADER must differ".to_string(),
            ));
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 8080)
    pub port: u16,

    // =========================================================================
    // Pipeline Configuration
    // =========================================================================
    pub pipeline: PipelineOptions,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Trusted proxy CIDR ranges. Forwarding headers (`X-Forwarded-For`,
    /// `X-Real-IP`) are only honored when the connection originates from one
    /// of these networks; otherwise the socket address is the client key.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarding headers ignored)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter directive (e.g., "info", "omnibus=debug")
    pub log_level: String,

    /// Logger name recorded on every line (default: "omnibus")
    pub log_name: String,

    /// Log output format (default: pretty)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration value is invalid
    /// (e.g., non-numeric PORT value, malformed header name).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,

            // Pipeline
            pipeline: PipelineOptions {
                rate_limit: RateLimitOptions {
                    window: Duration::from_millis(Self::parse_env(
                        "RATE_LIMIT_WINDOW_MS",
                        DEFAULT_WINDOW_MS,
                    )?),
                    max_keys: Self::parse_env("RATE_LIMIT_MAX_KEYS", DEFAULT_MAX_KEYS)?,
                    requests_per_window: Self::parse_env(
                        "RATE_LIMIT_REQUESTS",
                        DEFAULT_REQUESTS_PER_WINDOW,
                    )?,
                },
                timeout: Duration::from_millis(Self::parse_env(
                    "REQUEST_TIMEOUT_MS",
                    DEFAULT_TIMEOUT_MS,
                )?),
                headers: HeaderNames {
                    tracking: Self::parse_header("TRACKING_HEADER", DEFAULT_TRACKING_HEADER)?,
                    timing: Self::parse_header("TIMING_HEADER", DEFAULT_TIMING_HEADER)?,
                },
                namespace: env::var("STATE_NAMESPACE")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            },

            // Security
            trusted_proxies: Self::parse_trusted_proxies(),

            // Observability
            log_level: env::var("RUST_LOG")
                .or_else(|_| env::var("LOG_LEVEL"))
                .unwrap_or_else(|_| "info".to_string()),
            log_name: env::var("LOG_NAME").unwrap_or_else(|_| "omnibus".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
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
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        self.pipeline.validate()?;

        if self.log_name.trim().is_empty() {
            return Err(AppError::ConfigError(
                "LOG_NAME must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.pipeline.rate_limit.enabled()
    }

    /// Check if trusted proxy validation is enabled.
    ///
    /// When enabled, forwarding headers are only trusted if the request
    /// originates from a configured trusted proxy network.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
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
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a header name, accepting any casing.
    fn parse_header(name: &str, default: &'static str) -> AppResult<HeaderName> {
        let raw = env::var(name).unwrap_or_else(|_| default.to_string());
        HeaderName::from_bytes(raw.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| AppError::ConfigError(format!("Invalid {name} '{raw}': {e}")))
    }

    /// Parse trusted proxy CIDR ranges from environment variable.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarding headers are never trusted)
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
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
            port: 8080,
            // Pipeline
            pipeline: PipelineOptions::default(),
            // Security
            trusted_proxies: vec![],
            // Observability
            log_level: "info".to_string(),
            log_name: "omnibus".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
