//! Error types for the relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while relaying a request
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("Malformed target: {0}")]
    MalformedTarget(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Target resolves to a private address: {0}")]
    PrivateAddress(String),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Upstream request failed: {0}")]
    UpstreamFailure(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalFailure(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout(err.to_string())
        } else {
            RelayError::UpstreamFailure(err.to_string())
        }
    }
}

impl RelayError {
    /// Convert error to HTTP status code
    ///
    /// - Malformed or invalid targets: 400 Bad Request
    /// - Private address targets: 403 Forbidden
    /// - Rate limited clients: 429 Too Many Requests
    /// - Upstream failures and timeouts: 502 Bad Gateway
    /// - Everything else: 500 Internal Server Error
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::MalformedTarget(_) => 400,
            RelayError::InvalidTarget(_) => 400,
            RelayError::PrivateAddress(_) => 403,
            RelayError::RateLimited(_) => 429,
            RelayError::UpstreamFailure(_) => 502,
            RelayError::Timeout(_) => 502,
            RelayError::ConfigError(_) => 500,
            RelayError::IoError(_) => 500,
            RelayError::InternalFailure(_) => 500,
        }
    }

    /// Same as [`RelayError::to_http_status`], as a typed status code
    pub fn status_code(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.to_http_status())
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Metric label describing the rejection
    pub fn outcome_label(&self) -> &'static str {
        match self {
            RelayError::MalformedTarget(_) => "malformed",
            RelayError::InvalidTarget(_) => "invalid",
            RelayError::PrivateAddress(_) => "private",
            RelayError::RateLimited(_) => "rate_limited",
            RelayError::UpstreamFailure(_) | RelayError::Timeout(_) => "upstream_error",
            RelayError::ConfigError(_) | RelayError::IoError(_) | RelayError::InternalFailure(_) => {
                "internal_error"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayError::MalformedTarget("x".into()).to_http_status(), 400);
        assert_eq!(RelayError::InvalidTarget("x".into()).to_http_status(), 400);
        assert_eq!(RelayError::PrivateAddress("x".into()).to_http_status(), 403);
        assert_eq!(RelayError::RateLimited("x".into()).to_http_status(), 429);
        assert_eq!(RelayError::UpstreamFailure("x".into()).to_http_status(), 502);
        assert_eq!(RelayError::Timeout("x".into()).to_http_status(), 502);
        assert_eq!(RelayError::InternalFailure("x".into()).to_http_status(), 500);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: RelayError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, RelayError::IoError(_)));
        assert_eq!(err.status_code(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(RelayError::Timeout("t".into()).outcome_label(), "upstream_error");
        assert_eq!(RelayError::PrivateAddress("p".into()).outcome_label(), "private");
    }
}
