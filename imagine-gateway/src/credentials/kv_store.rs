//! Shared key/value backend.
//!
//! Layout, with `<prefix>` defaulting to `sso:`:
//!
//! - `<prefix>usage:<key>` hash of integer fields `count`, `last_used`,
//!   `first_used`, `failed`, `age_verified`
//! - `<prefix>index` rotation counter, advanced with INCR
//! - `<prefix>daily_reset` start of the current usage window
//!
//! Every field update is a single atomic store command, so several gateway
//! instances can share one store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::error::CredentialError;
use super::store::{CredentialStore, StoreSnapshot};
use super::types::UsageRecord;

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "sso:";

/// The handful of key/value commands the store needs.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CredentialError>;
    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), CredentialError>;
    /// Set `field` only if it does not exist yet.
    async fn hsetnx(&self, key: &str, field: &str, value: i64) -> Result<(), CredentialError>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, CredentialError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CredentialError>;
    async fn set(&self, key: &str, value: i64) -> Result<(), CredentialError>;
    /// Increment and return the new value.
    async fn incr(&self, key: &str) -> Result<i64, CredentialError>;
    async fn close(&self) -> Result<(), CredentialError> {
        Ok(())
    }
}

/// Redis client over a reconnecting connection manager.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, CredentialError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Connected to Redis");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CredentialError> {
        let map: HashMap<String, String> = self.conn().hgetall(key).await?;
        Ok(map)
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), CredentialError> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: i64) -> Result<(), CredentialError> {
        let _: () = self.conn().hset_nx(key, field, value).await?;
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, CredentialError> {
        let value: i64 = self.conn().hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CredentialError> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CredentialError> {
        let value: i64 = self.conn().incr(key, 1).await?;
        Ok(value)
    }
}

/// In-process key/value map with the same command semantics.
#[derive(Debug, Default)]
pub struct MemoryKv {
    strings: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_int(key: &str, raw: &str) -> Result<i64, CredentialError> {
    raw.parse()
        .map_err(|_| CredentialError::store(format!("value at {key} is not an integer")))
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CredentialError> {
        Ok(self.hashes.lock().get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), CredentialError> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: i64) -> Result<(), CredentialError> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, CredentialError> {
        let mut hashes = self.hashes.lock();
        let slot = hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let value = parse_int(key, slot)? + delta;
        *slot = value.to_string();
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.strings.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), CredentialError> {
        self.strings
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CredentialError> {
        let mut strings = self.strings.lock();
        let slot = strings
            .entry(key.to_string())
            .or_insert_with(|| "0".to_string());
        let value = parse_int(key, slot)? + 1;
        *slot = value.to_string();
        Ok(value)
    }
}

const FIELD_COUNT: &str = "count";
const FIELD_LAST_USED: &str = "last_used";
const FIELD_FIRST_USED: &str = "first_used";
const FIELD_FAILED: &str = "failed";
const FIELD_AGE_VERIFIED: &str = "age_verified";

/// Usage store on top of a [`KvClient`].
pub struct KvCredentialStore<K: KvClient> {
    kv: K,
    prefix: String,
}

impl<K: KvClient> KvCredentialStore<K> {
    pub fn new(kv: K, prefix: impl Into<String>) -> Self {
        Self {
            kv,
            prefix: prefix.into(),
        }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    fn usage_key(&self, key: &str) -> String {
        format!("{}usage:{}", self.prefix, key)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.prefix)
    }

    fn daily_reset_key(&self) -> String {
        format!("{}daily_reset", self.prefix)
    }

    async fn read_int(&self, key: &str) -> Result<i64, CredentialError> {
        match self.kv.get(key).await? {
            Some(raw) => parse_int(key, &raw),
            None => Ok(0),
        }
    }

    async fn read_usage(&self, key: &str) -> Result<Option<UsageRecord>, CredentialError> {
        let fields = self.kv.hgetall(&self.usage_key(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let int = |name: &str| -> i64 {
            fields
                .get(name)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0)
        };
        Ok(Some(UsageRecord {
            count: int(FIELD_COUNT).max(0) as u32,
            last_used: int(FIELD_LAST_USED),
            first_used: int(FIELD_FIRST_USED),
            failed: int(FIELD_FAILED) != 0,
            age_verified: int(FIELD_AGE_VERIFIED) != 0,
        }))
    }
}

#[async_trait]
impl<K: KvClient> CredentialStore for KvCredentialStore<K> {
    fn backend(&self) -> &'static str {
        "kv"
    }

    async fn sync_keys(&self, keys: &[String], now: i64) -> Result<(), CredentialError> {
        for key in keys {
            let usage_key = self.usage_key(key);
            self.kv.hsetnx(&usage_key, FIELD_COUNT, 0).await?;
            self.kv.hsetnx(&usage_key, FIELD_LAST_USED, 0).await?;
            self.kv.hsetnx(&usage_key, FIELD_FIRST_USED, now).await?;
            self.kv.hsetnx(&usage_key, FIELD_FAILED, 0).await?;
            self.kv.hsetnx(&usage_key, FIELD_AGE_VERIFIED, 0).await?;
        }
        debug!(count = keys.len(), "Synced credential keys to store");
        Ok(())
    }

    async fn snapshot(&self, keys: &[String]) -> Result<StoreSnapshot, CredentialError> {
        let last_reset = self.read_int(&self.daily_reset_key()).await?;
        let cursor = self.read_int(&self.index_key()).await?.max(0) as u64;

        let mut usage = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read_usage(key).await? {
                usage.insert(key.clone(), record);
            }
        }

        Ok(StoreSnapshot {
            last_reset,
            cursor,
            usage,
        })
    }

    async fn incr_usage(&self, key: &str, now: i64) -> Result<(), CredentialError> {
        let usage_key = self.usage_key(key);
        self.kv.hincrby(&usage_key, FIELD_COUNT, 1).await?;
        self.kv.hset(&usage_key, FIELD_LAST_USED, now).await?;
        self.kv.hsetnx(&usage_key, FIELD_FIRST_USED, now).await
    }

    async fn set_failed(&self, key: &str, failed: bool) -> Result<(), CredentialError> {
        self.kv
            .hset(&self.usage_key(key), FIELD_FAILED, i64::from(failed))
            .await
    }

    async fn set_age_verified(&self, key: &str, verified: bool) -> Result<(), CredentialError> {
        self.kv
            .hset(&self.usage_key(key), FIELD_AGE_VERIFIED, i64::from(verified))
            .await
    }

    async fn advance_cursor(&self) -> Result<u64, CredentialError> {
        let value = self.kv.incr(&self.index_key()).await?;
        Ok((value - 1).max(0) as u64)
    }

    async fn start_window(&self, now: i64) -> Result<(), CredentialError> {
        self.kv.set(&self.daily_reset_key(), now).await
    }

    async fn reset_usage(&self, keys: &[String], now: i64) -> Result<(), CredentialError> {
        for key in keys {
            let usage_key = self.usage_key(key);
            self.kv.hset(&usage_key, FIELD_COUNT, 0).await?;
            self.kv.hset(&usage_key, FIELD_FAILED, 0).await?;
        }
        self.kv.set(&self.daily_reset_key(), now).await
    }

    async fn clear_failed(&self, keys: &[String]) -> Result<(), CredentialError> {
        for key in keys {
            self.kv.hset(&self.usage_key(key), FIELD_FAILED, 0).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CredentialError> {
        self.kv.close().await
    }
}
