//! Error types for the redq job queue library.

use thiserror::Error;

/// The main error type for the redq library.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection, protocol, or script error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API misuse by the caller, e.g. calling `process` twice.
    #[error("Misuse: {0}")]
    Misuse(&'static str),

    /// The queue has been closed; no further operations are accepted.
    #[error("Queue is closed")]
    Closed,
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_misuse() {
        let err = QueueError::Misuse("process may only be called once");
        assert_eq!(format!("{}", err), "Misuse: process may only be called once");
    }

    #[test]
    fn test_error_display_closed() {
        let err = QueueError::Closed;
        assert_eq!(format!("{}", err), "Queue is closed");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }

    #[test]
    fn test_error_display_serialization() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = QueueError::Serialization(json_err);
        let display = format!("{}", err);
        assert!(display.starts_with("Serialization error:"));
    }
}
