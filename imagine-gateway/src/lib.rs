//! Credential-pooled gateway for streaming image generation.
//!
//! - [`credentials`]: Token pool with quota tracking and rotation strategies
//! - [`generation`]: Retry orchestration and progress streaming
//! - [`services`]: Service container wiring everything from [`config`]

pub mod config;
pub mod credentials;
pub mod error;
pub mod generation;
pub mod images;
pub mod logging;
pub mod services;

pub use error::{Error, Result};
