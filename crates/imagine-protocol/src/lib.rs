//! Imagine: client for the Grok Imagine WebSocket image generation endpoint.
//!
//! One call to [`AttemptRunner::run_attempt`] opens one session with one
//! credential, requests images for a prompt and follows the progressive
//! deliveries until the attempt resolves into an [`AttemptResult`].
//!
//! ## Core Types
//!
//! - [`ProtocolClient`] - Session driver and attempt state machine
//! - [`ProtocolConfig`] - Endpoint, headers and timing thresholds
//! - [`GenerationProgress`] - Per-image quality tracking within an attempt
//! - [`AttemptResult`] - Classified outcome of an attempt
//!
//! ## Persistence
//!
//! - [`ImageSink`] - Destination for collected images
//! - [`FsImageSink`] - Writes images into a local directory
//!
//! ## Side calls
//!
//! - [`AgeVerifier`] - One-time age verification for a token

pub mod attempt;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod message;
pub mod progress;
pub mod storage;
pub mod verify;

pub use attempt::AttemptResult;
pub use client::{AttemptRequest, AttemptRunner, ProgressObserver, ProtocolClient, mask_token};
pub use config::{DEFAULT_ORIGIN, DEFAULT_USER_AGENT, DEFAULT_WS_URL, ProtocolConfig};
pub use error::{ProtocolError, Result};
pub use http::{apply_proxy, build_http_client, install_rustls_provider};
pub use message::{CreateItemRequest, Frame, InboundMessage};
pub use progress::{GenerationProgress, ImageProgress, ImageStage, classify_stage, extract_image_id};
pub use storage::{FsImageSink, ImageSink, MemoryImageSink, SavedImage, image_file_name};
pub use verify::{AgeVerifier, HttpAgeVerifier, NoopAgeVerifier};
