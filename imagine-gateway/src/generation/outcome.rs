//! Classified generation outcomes.

use imagine_protocol::{AttemptResult, SavedImage};
use serde::Serialize;
use thiserror::Error;

/// Images produced by a successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedImages {
    pub images: Vec<SavedImage>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// The attempt hit its deadline and returned what it had.
    pub partial: bool,
}

/// Why a generation failed.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("no available credential: {0}")]
    NoCredentialAvailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("blocked: {0}")]
    Blocked(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("generation timed out")]
    Timeout,

    #[error("no image data received")]
    NoImageData,

    #[error("upstream error {code}: {message}")]
    Upstream { code: String, message: String },

    #[error("all retries failed")]
    AllRetriesFailed,
}

impl GenerationError {
    /// Stable snake_case code.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCredentialAvailable(_) => "no_credential_available",
            Self::RateLimited(_) => "rate_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::Blocked(_) => "blocked",
            Self::ConnectionError(_) => "connection_error",
            Self::Timeout => "timeout",
            Self::NoImageData => "no_image_data",
            Self::Upstream { .. } => "upstream_error",
            Self::AllRetriesFailed => "all_retries_failed",
        }
    }

    /// Failure attributable to the credential, worth retrying with another one.
    pub fn is_credential_related(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Unauthorized(_) | Self::Blocked(_) | Self::ConnectionError(_)
        )
    }
}

/// Map a failed attempt to its error. `None` for results that carry images.
pub(crate) fn attempt_error(result: AttemptResult) -> Option<GenerationError> {
    Some(match result {
        AttemptResult::Success { .. } => return None,
        AttemptResult::Timeout { partial_images } if !partial_images.is_empty() => return None,
        AttemptResult::Timeout { .. } => GenerationError::Timeout,
        AttemptResult::RateLimited { message } => GenerationError::RateLimited(message),
        AttemptResult::Blocked { message } => GenerationError::Blocked(message),
        AttemptResult::Unauthorized { message } => GenerationError::Unauthorized(message),
        AttemptResult::ConnectionError { message } => GenerationError::ConnectionError(message),
        AttemptResult::Upstream { code, message } => GenerationError::Upstream { code, message },
        AttemptResult::NoImageData => GenerationError::NoImageData,
    })
}

/// Result of one orchestrated request.
pub type GenerationOutcome = Result<GeneratedImages, GenerationError>;

/// JSON shape of an outcome for presentation layers.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeReport<'a> {
    Success {
        #[serde(flatten)]
        result: &'a GeneratedImages,
    },
    Error {
        kind: &'static str,
        message: String,
    },
}

impl<'a> OutcomeReport<'a> {
    pub fn from_outcome(outcome: &'a GenerationOutcome) -> Self {
        match outcome {
            Ok(result) => Self::Success { result },
            Err(e) => Self::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}
