//! Credential pool: source list, quota windows and selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::error::CredentialError;
use super::source::{parse_token_list, read_token_file};
use super::store::{CredentialStore, StoreSnapshot};
use super::strategy::{SelectionContext, select_index};
use super::types::{
    Credential, KeyStatus, PoolStatus, RESET_INTERVAL_SECS, RotationStrategy, key_hash,
};

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub strategy: RotationStrategy,
    /// Uses per token per usage window.
    pub daily_limit: u32,
    /// Token list file used by [`CredentialPool::reload`].
    pub source: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::default(),
            daily_limit: 10,
            source: None,
        }
    }
}

#[derive(Default)]
struct PoolState {
    credentials: Vec<Credential>,
}

impl PoolState {
    fn keys(&self) -> Vec<String> {
        self.credentials.iter().map(|c| c.key.clone()).collect()
    }
}

/// Supplies credentials for attempts and tracks their usage.
///
/// Every operation runs inside one exclusive section per pool, so
/// read-modify-write sequences such as "check availability, then advance the
/// rotation counter" never interleave.
pub struct CredentialPool {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(config: PoolConfig, store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    #[inline]
    pub fn strategy(&self) -> RotationStrategy {
        self.config.strategy
    }

    #[inline]
    pub fn daily_limit(&self) -> u32 {
        self.config.daily_limit
    }

    /// Number of loaded tokens.
    pub async fn len(&self) -> usize {
        self.state.lock().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replace the token set with the tokens in `text`.
    ///
    /// Usage history is kept for tokens that remain in the list.
    pub async fn load(&self, text: &str) -> Result<usize, CredentialError> {
        let mut state = self.state.lock().await;
        self.replace_tokens(&mut state, parse_token_list(text)).await
    }

    /// Replace the token set with the tokens listed in `path`.
    pub async fn load_file(&self, path: &Path) -> Result<usize, CredentialError> {
        let tokens = read_token_file(path).await?;
        let mut state = self.state.lock().await;
        self.replace_tokens(&mut state, tokens).await
    }

    /// Re-read the configured source file.
    pub async fn reload(&self) -> Result<usize, CredentialError> {
        let mut state = self.state.lock().await;
        self.reload_locked(&mut state).await
    }

    async fn reload_locked(&self, state: &mut PoolState) -> Result<usize, CredentialError> {
        let Some(source) = self.config.source.as_deref() else {
            warn!("No token source configured, nothing to reload");
            return Ok(state.credentials.len());
        };
        let tokens = read_token_file(source).await?;
        self.replace_tokens(state, tokens).await
    }

    async fn replace_tokens(
        &self,
        state: &mut PoolState,
        tokens: Vec<String>,
    ) -> Result<usize, CredentialError> {
        let credentials: Vec<Credential> = tokens.into_iter().map(Credential::new).collect();
        let keys: Vec<String> = credentials.iter().map(|c| c.key.clone()).collect();
        self.store.sync_keys(&keys, self.clock.now()).await?;
        state.credentials = credentials;

        info!(
            count = state.credentials.len(),
            strategy = %self.config.strategy,
            backend = self.store.backend(),
            "Loaded credentials"
        );
        Ok(state.credentials.len())
    }

    /// Select the next credential according to the configured strategy.
    ///
    /// Returns `None` when every token is over its daily limit. When every
    /// token is marked failed instead, the failed flags are cleared and the
    /// first token is returned.
    pub async fn select_next(&self) -> Result<Option<Credential>, CredentialError> {
        let mut state = self.state.lock().await;

        if state.credentials.is_empty() && self.config.source.is_some() {
            self.reload_locked(&mut state).await?;
        }
        if state.credentials.is_empty() {
            return Ok(None);
        }

        let keys = state.keys();
        let now = self.clock.now();
        let mut snapshot = self.store.snapshot(&keys).await?;
        if self.check_window(&keys, &snapshot, now).await? {
            snapshot = self.store.snapshot(&keys).await?;
        }

        let daily_limit = self.config.daily_limit;
        let (available, records): (Vec<&Credential>, Vec<_>) = state
            .credentials
            .iter()
            .map(|c| (c, snapshot.usage_of(&c.key)))
            .filter(|(_, usage)| usage.is_available(daily_limit))
            .unzip();

        if available.is_empty() {
            return self.recover_exhausted(&state, &keys, &snapshot).await;
        }

        let cursor = match self.config.strategy {
            RotationStrategy::RoundRobin => self.store.advance_cursor().await?,
            _ => snapshot.cursor,
        };
        let ctx = SelectionContext {
            daily_limit,
            now,
            cursor,
            draw: rand::random::<f64>(),
        };
        let selected = available[select_index(self.config.strategy, &records, &ctx)].clone();

        debug!(
            token = %selected.masked(),
            strategy = %self.config.strategy,
            available = available.len(),
            "Selected credential"
        );
        Ok(Some(selected))
    }

    /// Start or roll the usage window. Returns `true` if the store changed.
    async fn check_window(
        &self,
        keys: &[String],
        snapshot: &StoreSnapshot,
        now: i64,
    ) -> Result<bool, CredentialError> {
        if snapshot.last_reset == 0 {
            self.store.start_window(now).await?;
            return Ok(true);
        }
        if now - snapshot.last_reset >= RESET_INTERVAL_SECS {
            info!("Running daily usage reset");
            self.store.reset_usage(keys, now).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn recover_exhausted(
        &self,
        state: &PoolState,
        keys: &[String],
        snapshot: &StoreSnapshot,
    ) -> Result<Option<Credential>, CredentialError> {
        warn!("All credentials are exhausted or failed");

        let all_failed = state
            .credentials
            .iter()
            .all(|c| snapshot.usage_of(&c.key).failed);
        if !all_failed {
            return Ok(None);
        }

        self.store.clear_failed(keys).await?;
        info!("Cleared failed flags of all credentials");
        Ok(state.credentials.first().cloned())
    }

    /// Clear the failed flag after a confirmed success.
    pub async fn record_success(&self, token: &str) -> Result<(), CredentialError> {
        let _state = self.state.lock().await;
        self.store.set_failed(&key_hash(token), false).await
    }

    /// Count one confirmed generation against the token's daily limit.
    pub async fn record_usage(&self, token: &str) -> Result<(), CredentialError> {
        let _state = self.state.lock().await;
        self.store
            .incr_usage(&key_hash(token), self.clock.now())
            .await?;
        debug!(token = %imagine_protocol::mask_token(token), "Recorded credential usage");
        Ok(())
    }

    pub async fn record_failure(&self, token: &str, reason: &str) -> Result<(), CredentialError> {
        let _state = self.state.lock().await;
        self.store.set_failed(&key_hash(token), true).await?;
        warn!(token = %imagine_protocol::mask_token(token), reason = %reason, "Marked credential as failed");
        Ok(())
    }

    pub async fn get_age_verified(&self, token: &str) -> Result<bool, CredentialError> {
        let _state = self.state.lock().await;
        let key = key_hash(token);
        let snapshot = self.store.snapshot(std::slice::from_ref(&key)).await?;
        Ok(snapshot.usage_of(&key).age_verified)
    }

    pub async fn set_age_verified(&self, token: &str, verified: bool) -> Result<(), CredentialError> {
        let _state = self.state.lock().await;
        self.store.set_age_verified(&key_hash(token), verified).await?;
        info!(token = %imagine_protocol::mask_token(token), verified, "Updated age verification");
        Ok(())
    }

    /// Zero every usage count and clear every failed flag now.
    pub async fn reset_usage(&self) -> Result<(), CredentialError> {
        let state = self.state.lock().await;
        self.store
            .reset_usage(&state.keys(), self.clock.now())
            .await?;
        info!("Manual usage reset complete");
        Ok(())
    }

    pub async fn status(&self) -> Result<PoolStatus, CredentialError> {
        let state = self.state.lock().await;
        let snapshot = self.store.snapshot(&state.keys()).await?;
        let daily_limit = self.config.daily_limit;

        let keys: Vec<KeyStatus> = state
            .credentials
            .iter()
            .map(|c| {
                let usage = snapshot.usage_of(&c.key);
                KeyStatus {
                    key_prefix: c.masked(),
                    used_today: usage.count,
                    remaining: usage.remaining(daily_limit),
                    last_used: usage.last_used,
                    failed: usage.failed,
                    age_verified: usage.age_verified,
                }
            })
            .collect();

        let next_reset_timestamp = if snapshot.last_reset > 0 {
            snapshot.last_reset + RESET_INTERVAL_SECS
        } else {
            0
        };

        Ok(PoolStatus {
            total_tokens: state.credentials.len(),
            failed_count: keys.iter().filter(|k| k.failed).count(),
            strategy: self.config.strategy,
            daily_limit,
            next_reset_timestamp,
            keys,
        })
    }

    /// Release the store.
    pub async fn close(&self) -> Result<(), CredentialError> {
        let _state = self.state.lock().await;
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::clock::ManualClock;
    use crate::credentials::kv_store::{KvCredentialStore, MemoryKv};

    const START: i64 = 1_700_000_000;

    fn pool(strategy: RotationStrategy, daily_limit: u32) -> (CredentialPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(KvCredentialStore::new(MemoryKv::new(), "test:"));
        let config = PoolConfig {
            strategy,
            daily_limit,
            source: None,
        };
        (CredentialPool::new(config, store, clock.clone()), clock)
    }

    async fn next_token(pool: &CredentialPool) -> Option<String> {
        pool.select_next().await.unwrap().map(|c| c.token)
    }

    #[tokio::test]
    async fn test_empty_pool_selects_nothing() {
        let (pool, _) = pool(RotationStrategy::Hybrid, 10);
        assert_eq!(next_token(&pool).await, None);
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_token_once() {
        let (pool, _) = pool(RotationStrategy::RoundRobin, 10);
        pool.load("a\nb\nc\n").await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next_token(&pool).await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_never_selects_failed_or_exhausted() {
        for strategy in [
            RotationStrategy::RoundRobin,
            RotationStrategy::LeastUsed,
            RotationStrategy::LeastRecent,
            RotationStrategy::Weighted,
            RotationStrategy::Hybrid,
        ] {
            let (pool, _) = pool(strategy, 2);
            pool.load("a\nb\nc\n").await.unwrap();
            pool.record_failure("a", "test").await.unwrap();
            pool.record_usage("b").await.unwrap();
            pool.record_usage("b").await.unwrap();

            for _ in 0..10 {
                assert_eq!(next_token(&pool).await.as_deref(), Some("c"), "{strategy}");
            }
        }
    }

    #[tokio::test]
    async fn test_all_failed_recovers_first_token() {
        let (pool, _) = pool(RotationStrategy::Hybrid, 5);
        pool.load("a\nb\n").await.unwrap();
        pool.record_failure("a", "test").await.unwrap();
        pool.record_failure("b", "test").await.unwrap();

        assert_eq!(next_token(&pool).await.as_deref(), Some("a"));
        let status = pool.status().await.unwrap();
        assert_eq!(status.failed_count, 0);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_is_not_recovered() {
        let (pool, _) = pool(RotationStrategy::Hybrid, 1);
        pool.load("a\nb\n").await.unwrap();
        pool.record_usage("a").await.unwrap();
        pool.record_failure("b", "test").await.unwrap();

        assert_eq!(next_token(&pool).await, None);
        assert_eq!(pool.status().await.unwrap().failed_count, 1);
    }

    #[tokio::test]
    async fn test_daily_reset_before_selection() {
        let (pool, clock) = pool(RotationStrategy::LeastUsed, 1);
        pool.load("a\nb\n").await.unwrap();
        // First selection starts the window
        assert!(next_token(&pool).await.is_some());
        pool.record_usage("a").await.unwrap();
        pool.record_failure("b", "test").await.unwrap();
        clock.advance(3600);
        assert_eq!(next_token(&pool).await, None);

        clock.advance(RESET_INTERVAL_SECS);
        assert_eq!(next_token(&pool).await.as_deref(), Some("a"));

        let status = pool.status().await.unwrap();
        assert!(status.keys.iter().all(|k| k.used_today == 0 && !k.failed));
        assert_eq!(
            status.next_reset_timestamp,
            START + 3600 + 2 * RESET_INTERVAL_SECS
        );
    }

    #[tokio::test]
    async fn test_success_clears_failed_flag() {
        let (pool, _) = pool(RotationStrategy::Hybrid, 5);
        pool.load("a\nb\n").await.unwrap();
        pool.record_failure("a", "test").await.unwrap();
        pool.record_success("a").await.unwrap();
        assert_eq!(pool.status().await.unwrap().failed_count, 0);
    }

    #[tokio::test]
    async fn test_reload_preserves_usage() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("key.txt");
        tokio::fs::write(&source, "a\nb\n").await.unwrap();

        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(KvCredentialStore::new(MemoryKv::new(), "sso:"));
        let config = PoolConfig {
            strategy: RotationStrategy::Hybrid,
            daily_limit: 5,
            source: Some(source.clone()),
        };
        let pool = CredentialPool::new(config, store, clock);

        // Lazy load on first selection
        assert!(pool.select_next().await.unwrap().is_some());
        assert_eq!(pool.len().await, 2);
        pool.record_usage("b").await.unwrap();

        tokio::fs::write(&source, "b\nc\n").await.unwrap();
        assert_eq!(pool.reload().await.unwrap(), 2);

        let status = pool.status().await.unwrap();
        assert_eq!(status.keys[0].used_today, 1);
        assert_eq!(status.keys[1].used_today, 0);
    }

    #[tokio::test]
    async fn test_age_verified_flag() {
        let (pool, _) = pool(RotationStrategy::Hybrid, 5);
        pool.load("a\n").await.unwrap();
        assert!(!pool.get_age_verified("a").await.unwrap());
        pool.set_age_verified("a", true).await.unwrap();
        assert!(pool.get_age_verified("a").await.unwrap());
        assert!(pool.status().await.unwrap().keys[0].age_verified);
    }

    #[tokio::test]
    async fn test_status_and_manual_reset() {
        let (pool, _) = pool(RotationStrategy::Weighted, 3);
        pool.load("token-one-0123456789\ntoken-two-0123456789\n").await.unwrap();
        pool.record_usage("token-one-0123456789").await.unwrap();
        pool.record_failure("token-two-0123456789", "rate limited").await.unwrap();

        let status = pool.status().await.unwrap();
        assert_eq!(status.total_tokens, 2);
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.strategy, RotationStrategy::Weighted);
        assert_eq!(status.next_reset_timestamp, 0);
        assert_eq!(status.keys[0].key_prefix, "token-one-...");
        assert_eq!(status.keys[0].remaining, 2);
        assert_eq!(status.keys[0].last_used, START);

        pool.reset_usage().await.unwrap();
        let status = pool.status().await.unwrap();
        assert_eq!(status.failed_count, 0);
        assert_eq!(status.keys[0].used_today, 0);
        assert_eq!(status.next_reset_timestamp, START + RESET_INTERVAL_SECS);
    }

    #[tokio::test]
    async fn test_concurrent_pools_are_isolated() {
        let (first, _) = pool(RotationStrategy::Hybrid, 1);
        let (second, _) = pool(RotationStrategy::Hybrid, 1);
        first.load("a\n").await.unwrap();
        second.load("a\n").await.unwrap();

        first.record_usage("a").await.unwrap();
        assert_eq!(next_token(&first).await, None);
        assert_eq!(next_token(&second).await.as_deref(), Some("a"));
    }
}
