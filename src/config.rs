//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Pipeline
//!
//! - `REQUEST_DEADLINE_MS`: Per-request deadline (default: 30000, 0 = disabled)
//! - `ADMISSION_MODE`: `reject`, `delay` or `off` (default: `reject`)
//! - `RATE_LIMIT_RPS`: Requests per second admitted (default: 100)
//! - `RATE_LIMIT_BURST`: Burst capacity of the limiter (default: 50)
//! - `CATCH_PANICS`: Answer handler panics with 500 (default: true)
//!
//! # Observability
//!
//! - `ACCESS_LOG`: `tracing`, `json` or `line` (default: `tracing`)
//! - `ACCESS_LOG_FORMAT`: Template for `ACCESS_LOG=line`
//! - `ACCESS_LOG_DATE_FORMAT`: strftime pattern for `{start_time}` (default: RFC 3339)
//! - `LOG_JSON`: Emit application logs as JSON (default: false)
//! - `RUST_LOG`: Application log filter directives (default: `info`)
//! - `METRICS_PORT`: Prometheus endpoint port (default: 9090, 0 = disabled)

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::error::{AppError, AppResult};
use crate::middleware::deadline::{MAX_DEADLINE_MS, MIN_DEADLINE_MS};
use crate::middleware::log_sink::{DEFAULT_LINE_FORMAT, FormatError, LineFormat};

/// How the admission stage decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionKind {
    /// Answer 503 as soon as the limiter says no.
    #[default]
    Reject,
    /// Hold the request until the limiter grants it.
    Delay,
    /// No admission stage.
    Off,
}

impl FromStr for AdmissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "delay" => Ok(Self::Delay),
            "off" | "none" => Ok(Self::Off),
            other => Err(format!("expected reject, delay or off, got `{other}`")),
        }
    }
}

impl fmt::Display for AdmissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reject => "reject",
            Self::Delay => "delay",
            Self::Off => "off",
        })
    }
}

/// Where completion records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLogKind {
    #[default]
    Tracing,
    Json,
    Line,
}

impl FromStr for AccessLogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracing" => Ok(Self::Tracing),
            "json" => Ok(Self::Json),
            "line" => Ok(Self::Line),
            other => Err(format!("expected tracing, json or line, got `{other}`")),
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

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Pipeline Configuration
    // =========================================================================
    /// Per-request deadline in milliseconds (0 = no deadline stage)
    pub request_deadline_ms: u64,

    pub admission_mode: AdmissionKind,

    /// Requests per second admitted by the limiter
    pub rate_limit_rps: u32,

    /// Burst capacity of the limiter
    pub rate_limit_burst: u32,

    /// Whether handler panics are answered with 500
    pub catch_panics: bool,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    pub access_log: AccessLogKind,

    /// Template used when `access_log` is `Line`
    pub access_log_format: String,

    /// strftime pattern for `{start_time}` in line records
    pub access_log_date_format: Option<String>,

    /// Emit application logs as JSON
    pub log_json: bool,

    /// Log filter directives (default: "info")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any configuration is invalid
    /// (e.g., non-numeric PORT value, unknown ADMISSION_MODE).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,

            // Pipeline
            request_deadline_ms: Self::parse_env("REQUEST_DEADLINE_MS", 30_000)?,
            admission_mode: Self::parse_env("ADMISSION_MODE", AdmissionKind::Reject)?,
            rate_limit_rps: Self::parse_env("RATE_LIMIT_RPS", 100)?,
            rate_limit_burst: Self::parse_env("RATE_LIMIT_BURST", 50)?,
            catch_panics: Self::parse_env("CATCH_PANICS", true)?,

            // Observability
            access_log: Self::parse_env("ACCESS_LOG", AccessLogKind::Tracing)?,
            access_log_format: env::var("ACCESS_LOG_FORMAT")
                .ok()
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| DEFAULT_LINE_FORMAT.to_string()),
            access_log_date_format: env::var("ACCESS_LOG_DATE_FORMAT")
                .ok()
                .filter(|f| !f.is_empty()),
            log_json: Self::parse_env("LOG_JSON", false)?,
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
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
    pub fn validate(&self) -> AppResult<()> {
        if self.request_deadline_ms != 0
            && !(MIN_DEADLINE_MS..=MAX_DEADLINE_MS).contains(&self.request_deadline_ms)
        {
            return Err(AppError::ConfigError(format!(
                "REQUEST_DEADLINE_MS must be 0 or between {MIN_DEADLINE_MS} and {MAX_DEADLINE_MS}, got {}",
                self.request_deadline_ms
            )));
        }

        if self.admission_mode != AdmissionKind::Off && self.rate_limit_rps == 0 {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_RPS must be greater than 0 unless ADMISSION_MODE=off".to_string(),
            ));
        }

        if self.access_log == AccessLogKind::Line {
            self.line_format().map_err(|e| {
                let name = match e {
                    FormatError::InvalidDateFormat(_) => "ACCESS_LOG_DATE_FORMAT",
                    _ => "ACCESS_LOG_FORMAT",
                };
                AppError::ConfigError(format!("Invalid {name}: {e}"))
            })?;
        }

        Ok(())
    }

    /// The line template with the configured date format applied.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if either the template or the date format is
    /// invalid.
    pub fn line_format(&self) -> Result<LineFormat, FormatError> {
        let format = LineFormat::parse(&self.access_log_format)?;
        match &self.access_log_date_format {
            Some(date_format) => format.with_date_format(date_format),
            None => Ok(format),
        }
    }

    /// Filter for application logs, falling back to `info` when the
    /// directives do not parse.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The per-request deadline, if enabled.
    pub fn request_deadline(&self) -> Option<Duration> {
        (self.request_deadline_ms > 0).then(|| Duration::from_millis(self.request_deadline_ms))
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
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
            port: 3000,
            // Pipeline
            request_deadline_ms: 30_000,
            admission_mode: AdmissionKind::Reject,
            rate_limit_rps: 100,
            rate_limit_burst: 50,
            catch_panics: true,
            // Observability
            access_log: AccessLogKind::Tracing,
            access_log_format: DEFAULT_LINE_FORMAT.to_string(),
            access_log_date_format: None,
            log_json: false,
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.admission_mode, AdmissionKind::Reject);
        assert_eq!(config.access_log, AccessLogKind::Tracing);
        assert_eq!(config.request_deadline(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "192.168.1.1:8080");
    }

    #[test]
    fn test_zero_deadline_disables_stage() {
        let config = Config {
            request_deadline_ms: 0,
            ..Config::default()
        };

        assert!(config.request_deadline().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_deadline_upper_bound() {
        let config = Config {
            request_deadline_ms: MAX_DEADLINE_MS + 1,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("REQUEST_DEADLINE_MS"));
    }

    #[test]
    fn test_validate_zero_rps_needs_admission_off() {
        let config = Config {
            rate_limit_rps: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            rate_limit_rps: 0,
            admission_mode: AdmissionKind::Off,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_line_format() {
        let config = Config {
            access_log: AccessLogKind::Line,
            access_log_format: "{status} {{".to_string(),
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("ACCESS_LOG_FORMAT"));
    }

    #[test]
    fn test_validate_date_format() {
        let config = Config {
            access_log: AccessLogKind::Line,
            access_log_date_format: Some("%d/%b/%Y %!".to_string()),
            ..Config::default()
        };
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("ACCESS_LOG_DATE_FORMAT"));

        let config = Config {
            access_log: AccessLogKind::Line,
            access_log_date_format: Some("%d/%b/%Y:%H:%M:%S %z".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.line_format().is_ok());
    }

    #[test]
    fn test_log_filter_uses_log_level() {
        let config = Config {
            log_level: "gatekeep=debug,warn".to_string(),
            ..Config::default()
        };
        let filter = config.log_filter().to_string();
        assert!(filter.contains("gatekeep=debug"));
        assert!(filter.contains("warn"));

        let config = Config {
            log_level: "gatekeep=loudest".to_string(),
            ..Config::default()
        };
        assert_eq!(config.log_filter().to_string(), "info");
    }

    #[test]
    fn test_admission_kind_parsing() {
        assert_eq!("reject".parse::<AdmissionKind>(), Ok(AdmissionKind::Reject));
        assert_eq!(" Delay ".parse::<AdmissionKind>(), Ok(AdmissionKind::Delay));
        assert_eq!("off".parse::<AdmissionKind>(), Ok(AdmissionKind::Off));
        assert!("sometimes".parse::<AdmissionKind>().is_err());
        assert_eq!(AdmissionKind::Delay.to_string(), "delay");
    }

    #[test]
    fn test_access_log_kind_parsing() {
        assert_eq!("json".parse::<AccessLogKind>(), Ok(AccessLogKind::Json));
        assert_eq!("LINE".parse::<AccessLogKind>(), Ok(AccessLogKind::Line));
        assert!("syslog".parse::<AccessLogKind>().is_err());
    }

    #[test]
    fn test_metrics_addr() {
        let config = Config::default();
        assert_eq!(
            config.metrics_addr(),
            Some(SocketAddr::from(([0, 0, 0, 0], 9090)))
        );

        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }
}
