use thiserror::Error;

/// Application-wide error types for Mneme.
///
/// Cloneable so a single failed batch can be delivered to every caller
/// that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    /// HTTP request failed before a status code was available, or the body
    /// could not be decoded.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The knowledge service answered with a non-success status.
    #[error("Knowledge service error (HTTP {status_code}): {message}")]
    ServiceError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Request timed out.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A data sink refused an item.
    #[error("Data sink error: {0}")]
    SinkError(String),

    /// The circuit breaker refused the call without contacting the service.
    #[error("Circuit breaker '{name}' is open, retry after {retry_after_ms} ms")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    /// A pending query was dropped before its batch produced an answer.
    #[error("Query cancelled before completion")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::ServiceError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// Everything that originates at the knowledge-service boundary counts,
    /// including malformed responses. Local problems (configuration, sinks,
    /// cancellation) do not.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::HttpError(_)
            | AppError::SerializationError(_)
            | AppError::ServiceError { .. } => true,
            AppError::ConfigError(_)
            | AppError::SinkError(_)
            | AppError::CircuitOpen { .. }
            | AppError::Cancelled
            | AppError::Generic(_) => false,
        }
    }

    /// Returns true for throttling responses, which lengthen the breaker's
    /// recovery window.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitExceeded
                | AppError::ServiceError {
                    status_code: 429,
                    ..
                }
        )
    }
}
