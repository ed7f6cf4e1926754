//! Generation orchestration.
//!
//! - [`Generator`]: Retry loop over credentials and attempts
//! - [`GenerationStream`]: Progress events followed by one terminal result
//! - [`GenerationError`]: Classified failure with a stable kind code

mod orchestrator;
mod outcome;
mod request;
mod stream;

pub use orchestrator::{Generator, RetryPolicy};
pub use outcome::{GeneratedImages, GenerationError, GenerationOutcome, OutcomeReport};
pub use request::{
    DEFAULT_ASPECT_RATIO, DEFAULT_IMAGE_COUNT, GenerationDefaults, GenerationRequest,
    size_to_aspect_ratio,
};
pub use stream::{GenerationStream, ProgressEvent, STREAM_CHANNEL_CAPACITY, StreamEvent};
