//! Service layer module.
//!
//! Builds the credential pool, protocol client and generator from the
//! gateway configuration and owns their lifecycle.

pub mod container;

pub use container::ServiceContainer;
