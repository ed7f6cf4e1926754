//! Outcome of a single generation attempt.

use std::fmt;

use crate::storage::SavedImage;

/// Result of running one attempt with one credential.
#[derive(Debug, Clone)]
pub enum AttemptResult {
    /// At least one image was persisted.
    Success { images: Vec<SavedImage> },
    /// The upstream signalled rate limiting for this credential.
    RateLimited { message: String },
    /// Intermediate output arrived but no final image within the expected window.
    Blocked { message: String },
    /// The session was rejected.
    Unauthorized { message: String },
    /// The session could not be established or was lost.
    ConnectionError { message: String },
    /// The hard deadline expired; `partial_images` holds whatever was persisted.
    Timeout { partial_images: Vec<SavedImage> },
    /// A non rate-limit upstream error was the only signal received.
    Upstream { code: String, message: String },
    /// The session ended without any image data.
    NoImageData,
}

impl AttemptResult {
    /// Stable snake_case name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::RateLimited { .. } => "rate_limited",
            Self::Blocked { .. } => "blocked",
            Self::Unauthorized { .. } => "unauthorized",
            Self::ConnectionError { .. } => "connection_error",
            Self::Timeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::NoImageData => "no_image_data",
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub(crate) fn blocked() -> Self {
        Self::Blocked {
            message: "generation was blocked before a final image was produced".to_string(),
        }
    }
}

impl fmt::Display for AttemptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { images } => write!(f, "success ({} images)", images.len()),
            Self::RateLimited { message }
            | Self::Blocked { message }
            | Self::Unauthorized { message }
            | Self::ConnectionError { message } => write!(f, "{}: {}", self.kind(), message),
            Self::Timeout { partial_images } => {
                write!(f, "timeout ({} partial images)", partial_images.len())
            }
            Self::Upstream { code, message } => write!(f, "upstream error {code}: {message}"),
            Self::NoImageData => f.write_str("no image data received"),
        }
    }
}
