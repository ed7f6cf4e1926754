//! Core credential types.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::CredentialError;

/// Length of a usage window; elapsed-time triggered, not aligned to midnight.
pub const RESET_INTERVAL_SECS: i64 = 24 * 60 * 60;

/// Short stable hash of a token, used as its storage key.
///
/// First 12 hex chars of the MD5 digest.
pub fn key_hash(token: &str) -> String {
    let digest = Md5::digest(token.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(12);
    key
}

/// One session credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub key: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let key = key_hash(&token);
        Self { token, key }
    }

    /// Masked token, the only form that is ever logged.
    #[inline]
    pub fn masked(&self) -> String {
        imagine_protocol::mask_token(&self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.masked())
            .field("key", &self.key)
            .finish()
    }
}

/// Credential selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    LeastUsed,
    LeastRecent,
    Weighted,
    #[default]
    Hybrid,
}

impl RotationStrategy {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastUsed => "least_used",
            Self::LeastRecent => "least_recent",
            Self::Weighted => "weighted",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStrategy {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_used" => Ok(Self::LeastUsed),
            "least_recent" => Ok(Self::LeastRecent),
            "weighted" => Ok(Self::Weighted),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(CredentialError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Durable usage state of one credential.
///
/// Timestamps are unix seconds; `0` means never.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub count: u32,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub last_used: i64,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub first_used: i64,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub age_verified: bool,
}

impl UsageRecord {
    /// Fresh record for a token first seen at `now`.
    pub fn first_seen(now: i64) -> Self {
        Self {
            first_used: now,
            ..Self::default()
        }
    }

    /// Not failed and under the daily limit.
    #[inline]
    pub fn is_available(&self, daily_limit: u32) -> bool {
        !self.failed && self.count < daily_limit
    }

    #[inline]
    pub fn remaining(&self, daily_limit: u32) -> u32 {
        daily_limit.saturating_sub(self.count)
    }
}

// Older state files store fractional timestamps.
pub(super) fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    Ok(value as i64)
}

// Older state files store the flag as 0/1.
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Per-token entry of [`PoolStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub key_prefix: String,
    pub used_today: u32,
    pub remaining: u32,
    pub last_used: i64,
    pub failed: bool,
    pub age_verified: bool,
}

/// Pool summary for the administrative surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub total_tokens: usize,
    pub failed_count: usize,
    pub strategy: RotationStrategy,
    pub daily_limit: u32,
    /// `0` when no window has started yet.
    pub next_reset_timestamp: i64,
    pub keys: Vec<KeyStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_is_short_md5_prefix() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        assert_eq!(key_hash("abc"), "900150983cd2");
        assert_eq!(key_hash("abc").len(), 12);
        assert_ne!(key_hash("abc"), key_hash("abd"));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "round_robin".parse::<RotationStrategy>().unwrap(),
            RotationStrategy::RoundRobin
        );
        assert_eq!(
            " Hybrid ".parse::<RotationStrategy>().unwrap(),
            RotationStrategy::Hybrid
        );
        assert!(matches!(
            "random".parse::<RotationStrategy>(),
            Err(CredentialError::InvalidStrategy(_))
        ));
        assert_eq!(RotationStrategy::LeastRecent.to_string(), "least_recent");
    }

    #[test]
    fn test_usage_record_accepts_legacy_values() {
        let record: UsageRecord = serde_json::from_str(
            r#"{"count": 3, "last_used": 1700000000.75, "first_used": 1699990000.1, "failed": false, "age_verified": 1}"#,
        )
        .unwrap();
        assert_eq!(record.count, 3);
        assert_eq!(record.last_used, 1_700_000_000);
        assert!(record.age_verified);

        let record: UsageRecord = serde_json::from_str(r#"{"count": 1}"#).unwrap();
        assert_eq!(record.last_used, 0);
        assert!(!record.failed);
    }

    #[test]
    fn test_availability() {
        let mut record = UsageRecord::first_seen(100);
        assert!(record.is_available(2));
        record.count = 2;
        assert!(!record.is_available(2));
        assert_eq!(record.remaining(2), 0);
        record.count = 0;
        record.failed = true;
        assert!(!record.is_available(2));
    }

    #[test]
    fn test_credential_debug_masks_token() {
        let credential = Credential::new("0123456789abcdefghijklmnop");
        let debug = format!("{credential:?}");
        assert!(debug.contains("0123456789..."));
        assert!(!debug.contains("abcdefghij"));
    }
}
