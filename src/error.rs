use thiserror::Error;

use crate::middleware::log_sink::FormatError;
use crate::middleware::rate_limit::RateLimitError;

/// Errors raised while configuring or starting the server.
///
/// Request-time failures never surface here: admission and deadline answer
/// the client directly, and sink failures are swallowed.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid access log format: {0}")]
    Format(#[from] FormatError),

    #[error("Invalid rate limit: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_conversion() {
        let err: AppError = FormatError::UnknownField("cookie".to_string()).into();
        assert!(err.to_string().contains("cookie"));
    }

    #[test]
    fn test_rate_limit_error_conversion() {
        let err: AppError = RateLimitError::ZeroRps.into();
        assert!(matches!(err, AppError::RateLimit(RateLimitError::ZeroRps)));
    }
}
