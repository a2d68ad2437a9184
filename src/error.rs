//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Admission decisions themselves never fail; errors only arise while
/// building limiters, loading configuration or running the HTTP server.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was constructed with a parameter it cannot honor
    #[error("Invalid limiter parameter `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: String,
    },

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        TurnstileError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameter_message() {
        let err = TurnstileError::invalid("limit", "must be greater than zero");
        assert_eq!(
            err.to_string(),
            "Invalid limiter parameter `limit`: must be greater than zero"
        );
    }
}
