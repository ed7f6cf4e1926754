//! Credential pool module.
//!
//! Session tokens are loaded from a newline-delimited source list, selected
//! under one of five rotation strategies and metered against a daily limit.
//! Usage is persisted through a [`CredentialStore`] so it survives restarts.
//!
//! # Architecture
//!
//! - [`CredentialPool`]: Selection, quota windows and feedback
//! - [`CredentialStore`]: Usage persistence capability
//! - [`FileCredentialStore`]: Local JSON document backend
//! - [`KvCredentialStore`]: Shared key/value backend over a [`KvClient`]
//! - [`Clock`]: Time source for usage windows

mod clock;
mod error;
mod file_store;
mod kv_store;
mod pool;
mod source;
mod store;
mod strategy;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CredentialError;
pub use file_store::FileCredentialStore;
pub use kv_store::{DEFAULT_KEY_PREFIX, KvClient, KvCredentialStore, MemoryKv, RedisKv};
pub use pool::{CredentialPool, PoolConfig};
pub use source::{parse_token_list, read_token_file};
pub use store::{CredentialStore, StoreSnapshot};
pub use strategy::{SelectionContext, hybrid_score, select_index};
pub use types::{
    Credential, KeyStatus, PoolStatus, RESET_INTERVAL_SECS, RotationStrategy, UsageRecord,
    key_hash,
};
