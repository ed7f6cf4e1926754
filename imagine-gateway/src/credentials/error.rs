//! Credential error types.

use thiserror::Error;

/// Errors that can occur during credential pool operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No credentials configured.
    #[error("No credentials configured")]
    NoCredentials,

    /// Storage backend error.
    #[error("Store error: {0}")]
    Store(String),

    /// Shared store error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown rotation strategy name.
    #[error("Invalid rotation strategy: {0}")]
    InvalidStrategy(String),
}

impl CredentialError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Check if this error comes from the backing store and may clear on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Redis(_) | Self::Io(_))
    }
}
