//! Error types for QAFlow

use thiserror::Error;

/// Result type alias using QAFlow Error
pub type Result<T> = std::result::Result<T, Error>;

/// QAFlow error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider error from {service}: {message}")]
    Provider { service: String, message: String },

    #[error("Rate limit exceeded for {provider}/{operation}")]
    RateLimitExceeded { provider: String, operation: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Batch partially failed: {failed} of {total} items failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Step {step} failed: {reason}")]
    WorkflowStepFailure { step: String, reason: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn provider(service: impl Into<String>, message: impl ToString) -> Self {
        Error::Provider {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn rate_limited(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::RateLimitExceeded {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }
}
