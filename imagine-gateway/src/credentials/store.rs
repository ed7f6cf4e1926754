//! Credential usage persistence abstraction.
//!
//! Selection logic lives once in [`super::CredentialPool`]; a store only
//! keeps the per-key usage records, the rotation counter and the start of
//! the current usage window. Records are addressed by [`super::key_hash`],
//! never by the raw token.

use std::collections::HashMap;

use async_trait::async_trait;

use super::error::CredentialError;
use super::types::UsageRecord;

/// Point-in-time view of the store for a set of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Start of the current usage window, `0` if none started yet.
    pub last_reset: i64,
    /// Rotation counter (monotonic).
    pub cursor: u64,
    pub usage: HashMap<String, UsageRecord>,
}

impl StoreSnapshot {
    /// Usage of `key`, or an empty record if the store has none.
    pub fn usage_of(&self, key: &str) -> UsageRecord {
        self.usage.get(key).copied().unwrap_or_default()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Make sure every key has a record; new ones are first seen at `now`.
    ///
    /// Existing records are left untouched so usage survives a reload.
    async fn sync_keys(&self, keys: &[String], now: i64) -> Result<(), CredentialError>;

    /// Read the usage window, the rotation counter and the records of `keys`.
    async fn snapshot(&self, keys: &[String]) -> Result<StoreSnapshot, CredentialError>;

    /// Count one use and stamp `last_used`.
    async fn incr_usage(&self, key: &str, now: i64) -> Result<(), CredentialError>;

    async fn set_failed(&self, key: &str, failed: bool) -> Result<(), CredentialError>;

    async fn set_age_verified(&self, key: &str, verified: bool) -> Result<(), CredentialError>;

    /// Advance the rotation counter, returning its value before the advance.
    async fn advance_cursor(&self) -> Result<u64, CredentialError>;

    /// Start the first usage window at `now`.
    async fn start_window(&self, now: i64) -> Result<(), CredentialError>;

    /// Zero every usage count, clear every failed flag and start a new window at `now`.
    async fn reset_usage(&self, keys: &[String], now: i64) -> Result<(), CredentialError>;

    /// Clear the failed flag of every key.
    async fn clear_failed(&self, keys: &[String]) -> Result<(), CredentialError>;

    /// Release backend resources.
    async fn close(&self) -> Result<(), CredentialError>;
}
