//! Error types for Akari
//!
//! Centralized error handling using thiserror. Boundaries with their own
//! failure taxonomy (rate-limit backend, poster, composer) define local enums;
//! those are mostly handled where they occur rather than propagated.

use thiserror::Error;

/// All error types that can surface from the Akari core
#[derive(Debug, Error)]
pub enum AkariError {
    /// Candidate queue persistence error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Rate limiter backend error (normally swallowed by fail-open)
    #[error("Rate limit store error: {0}")]
    RateLimitStore(String),

    /// Configuration could not be used
    #[error("Config error: {0}")]
    Config(String),

    /// Image search failed
    #[error("Search error: {0}")]
    Search(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid blacklist pattern
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

/// Result type alias for Akari operations
pub type Result<T> = std::result::Result<T, AkariError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error() {
        let err = AkariError::Queue("file locked".to_string());
        assert_eq!(err.to_string(), "Queue error: file locked");
    }

    #[test]
    fn test_rate_limit_store_error() {
        let err = AkariError::RateLimitStore("database is locked".to_string());
        assert_eq!(err.to_string(), "Rate limit store error: database is locked");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AkariError = io_err.into();
        assert!(matches!(err, AkariError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: AkariError = json_err.into();
        assert!(matches!(err, AkariError::Json(_)));
    }

    #[test]
    fn test_regex_error_conversion() {
        let regex_err = regex::Regex::new("(unclosed").unwrap_err();
        let err: AkariError = regex_err.into();
        assert!(matches!(err, AkariError::Regex(_)));
    }
}
