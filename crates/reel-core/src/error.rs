//! Error types for the reel generation queue.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using reel's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for queue, provider, and persistence operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed enqueue payload or configuration value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation against an unknown job id.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Every candidate in the fallback chain is unconfigured or circuit-open.
    #[error("No provider available (tried: {})", format_tried(.tried))]
    NoProviderAvailable { tried: Vec<String> },

    /// Failure reported by a stage executor.
    #[error("Stage execution failed: {message}")]
    StageExecution { message: String, retryable: bool },

    /// The job was cancelled by caller request.
    #[error("Cancelled")]
    Cancelled,

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_tried(tried: &[String]) -> String {
    if tried.is_empty() {
        "none".to_string()
    } else {
        tried.join(", ")
    }
}

impl Error {
    /// Create a retryable stage failure (transient network errors, timeouts).
    pub fn transient(message: impl Into<String>) -> Self {
        Error::StageExecution {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable stage failure (malformed output, rejected input).
    pub fn permanent(message: impl Into<String>) -> Self {
        Error::StageExecution {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a job failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StageExecution { retryable, .. } => *retryable,
            Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::InvalidInput("priority out of range".to_string());
        assert_eq!(err.to_string(), "Invalid input: priority out of range");
    }

    #[test]
    fn test_error_display_job_not_found() {
        let id = Uuid::nil();
        let err = Error::JobNotFound(id);
        assert_eq!(err.to_string(), format!("Job not found: {}", id));
    }

    #[test]
    fn test_error_display_no_provider_lists_candidates() {
        let err = Error::NoProviderAvailable {
            tried: vec!["openai".to_string(), "ollama".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "No provider available (tried: openai, ollama)"
        );
    }

    #[test]
    fn test_error_display_no_provider_empty_chain() {
        let err = Error::NoProviderAvailable { tried: vec![] };
        assert_eq!(err.to_string(), "No provider available (tried: none)");
    }

    #[test]
    fn test_stage_failure_constructors() {
        let transient = Error::transient("connection reset");
        assert!(transient.is_retryable());
        assert_eq!(
            transient.to_string(),
            "Stage execution failed: connection reset"
        );

        let permanent = Error::permanent("script JSON missing scenes");
        assert!(!permanent.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::JobNotFound(Uuid::nil()).is_retryable());
        assert!(!Error::NoProviderAvailable { tried: vec![] }.is_retryable());
        assert!(!Error::InvalidInput("x".into()).is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(Error::Io(io).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(ref msg) if !msg.is_empty()));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
