//! Retry loop over credentials and attempts.

use std::sync::Arc;

use imagine_protocol::{
    AgeVerifier, AttemptRequest, AttemptResult, AttemptRunner, ProgressObserver, mask_token,
};
use tracing::{debug, error, info, warn};

use super::outcome::{GeneratedImages, GenerationError, GenerationOutcome, attempt_error};
use super::request::GenerationRequest;
use crate::credentials::CredentialPool;

/// Retry bounds for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts across all credentials.
    pub max_attempts: u32,
    /// Blocked attempts tolerated before giving up.
    pub max_blocked_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_blocked_attempts: 3,
        }
    }
}

/// Runs generation requests against the credential pool.
pub struct Generator {
    pool: Arc<CredentialPool>,
    runner: Arc<dyn AttemptRunner>,
    verifier: Arc<dyn AgeVerifier>,
    policy: RetryPolicy,
}

impl Generator {
    pub fn new(
        pool: Arc<CredentialPool>,
        runner: Arc<dyn AttemptRunner>,
        verifier: Arc<dyn AgeVerifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            runner,
            verifier,
            policy,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Generate images for `request`, rotating credentials on credential failures.
    ///
    /// A pinned credential is never rotated: its first failure is returned.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        observer: Option<&dyn ProgressObserver>,
    ) -> GenerationOutcome {
        let attempt_request = AttemptRequest::new(
            request.prompt.clone(),
            request.aspect_ratio.clone(),
            request.image_count,
        );
        let forced = request.credential.as_deref();
        let mut last_error = None;
        let mut blocked_attempts = 0;

        for attempt in 1..=self.policy.max_attempts {
            let token = match forced {
                Some(token) => token.to_string(),
                None => match self.pool.select_next().await {
                    Ok(Some(credential)) => credential.token,
                    Ok(None) => {
                        warn!(attempt, "No credential available");
                        return Err(GenerationError::NoCredentialAvailable(
                            "all credentials are exhausted or failed".to_string(),
                        ));
                    }
                    Err(e) => {
                        error!(attempt, error = %e, "Credential selection failed");
                        return Err(GenerationError::NoCredentialAvailable(e.to_string()));
                    }
                },
            };

            info!(
                attempt,
                max_attempts = self.policy.max_attempts,
                token = %mask_token(&token),
                "Starting generation attempt"
            );

            self.ensure_age_verified(&token).await;

            let result = self
                .runner
                .run_attempt(&token, &attempt_request, observer)
                .await;

            match result {
                AttemptResult::Success { images } => {
                    self.record_success(&token).await;
                    info!(attempt, count = images.len(), "Generation succeeded");
                    return Ok(GeneratedImages {
                        images,
                        attempts: attempt,
                        partial: false,
                    });
                }
                AttemptResult::Timeout { partial_images } if !partial_images.is_empty() => {
                    self.record_success(&token).await;
                    info!(attempt, count = partial_images.len(), "Generation timed out with partial images");
                    return Ok(GeneratedImages {
                        images: partial_images,
                        attempts: attempt,
                        partial: true,
                    });
                }
                result => {
                    let Some(err) = attempt_error(result) else {
                        return Err(GenerationError::AllRetriesFailed);
                    };

                    if !err.is_credential_related() {
                        warn!(attempt, kind = err.kind(), error = %err, "Generation failed");
                        return Err(err);
                    }

                    warn!(attempt, kind = err.kind(), error = %err, "Attempt failed");
                    self.record_failure(&token, &err).await;

                    if forced.is_some() {
                        return Err(err);
                    }

                    if matches!(err, GenerationError::Blocked(_)) {
                        blocked_attempts += 1;
                        if blocked_attempts >= self.policy.max_blocked_attempts {
                            warn!(blocked_attempts, "Blocked retry limit reached");
                            return Err(err);
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(GenerationError::AllRetriesFailed))
    }

    /// One-time best-effort verification; never blocks generation.
    async fn ensure_age_verified(&self, token: &str) {
        match self.pool.get_age_verified(token).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read age verification flag");
                return;
            }
        }

        match self.verifier.verify(token).await {
            Ok(true) => {
                if let Err(e) = self.pool.set_age_verified(token, true).await {
                    warn!(error = %e, "Failed to store age verification flag");
                }
            }
            Ok(false) => debug!(token = %mask_token(token), "Age verification not completed"),
            Err(e) => warn!(token = %mask_token(token), error = %e, "Age verification failed"),
        }
    }

    async fn record_success(&self, token: &str) {
        if let Err(e) = self.pool.record_success(token).await {
            warn!(error = %e, "Failed to record credential success");
        }
        if let Err(e) = self.pool.record_usage(token).await {
            warn!(error = %e, "Failed to record credential usage");
        }
    }

    async fn record_failure(&self, token: &str, err: &GenerationError) {
        if let Err(e) = self.pool.record_failure(token, &err.to_string()).await {
            warn!(error = %e, "Failed to record credential failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use imagine_protocol::{ImageStage, NoopAgeVerifier, ProtocolError, SavedImage};
    use parking_lot::Mutex;

    use crate::credentials::{
        KvCredentialStore, ManualClock, MemoryKv, PoolConfig, RotationStrategy,
    };
    use crate::generation::GenerationDefaults;

    /// Replays queued results and records which token ran each attempt.
    struct ScriptedRunner {
        results: Mutex<VecDeque<AttemptResult>>,
        tokens: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(results: Vec<AttemptResult>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                tokens: Mutex::new(Vec::new()),
            }
        }

        fn tokens(&self) -> Vec<String> {
            self.tokens.lock().clone()
        }
    }

    #[async_trait]
    impl AttemptRunner for ScriptedRunner {
        async fn run_attempt(
            &self,
            token: &str,
            _request: &AttemptRequest,
            _observer: Option<&dyn ProgressObserver>,
        ) -> AttemptResult {
            self.tokens.lock().push(token.to_string());
            self.results
                .lock()
                .pop_front()
                .unwrap_or(AttemptResult::NoImageData)
        }
    }

    struct CountingVerifier {
        calls: AtomicUsize,
        accept: bool,
    }

    #[async_trait]
    impl AgeVerifier for CountingVerifier {
        async fn verify(&self, _token: &str) -> imagine_protocol::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(true)
            } else {
                Err(ProtocolError::other("verification endpoint down"))
            }
        }
    }

    fn saved(id: &str) -> SavedImage {
        SavedImage {
            image_id: id.to_string(),
            stage: ImageStage::Final,
            file_name: format!("{id}.jpg"),
            path: PathBuf::from(format!("{id}.jpg")),
            url: format!("http://127.0.0.1:9563/images/{id}.jpg"),
            b64: String::new(),
            size_bytes: 1,
        }
    }

    fn success(id: &str) -> AttemptResult {
        AttemptResult::Success {
            images: vec![saved(id)],
        }
    }

    fn blocked() -> AttemptResult {
        AttemptResult::Blocked {
            message: "no final".to_string(),
        }
    }

    fn rate_limited() -> AttemptResult {
        AttemptResult::RateLimited {
            message: "slow down".to_string(),
        }
    }

    async fn pool(tokens: &str) -> Arc<CredentialPool> {
        let store = Arc::new(KvCredentialStore::new(MemoryKv::new(), "sso:"));
        let config = PoolConfig {
            strategy: RotationStrategy::RoundRobin,
            daily_limit: 10,
            source: None,
        };
        let pool = Arc::new(CredentialPool::new(
            config,
            store,
            Arc::new(ManualClock::new(1_700_000_000)),
        ));
        pool.load(tokens).await.unwrap();
        pool
    }

    fn generator(pool: Arc<CredentialPool>, runner: Arc<ScriptedRunner>) -> Generator {
        Generator::new(pool, runner, Arc::new(NoopAgeVerifier), RetryPolicy::default())
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a lighthouse at dusk", &GenerationDefaults::default())
    }

    #[tokio::test]
    async fn test_success_records_usage() {
        let pool = pool("a\nb\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![success("img1")]));
        let generator = generator(pool.clone(), runner.clone());

        let result = generator.generate(&request(), None).await.unwrap();

        assert_eq!(result.images.len(), 1);
        assert_eq!(result.attempts, 1);
        let status = pool.status().await.unwrap();
        let used: u32 = status.keys.iter().map(|k| k.used_today).sum();
        assert_eq!(used, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rotates_credential() {
        let pool = pool("a\nb\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![rate_limited(), success("img1")]));
        let generator = generator(pool.clone(), runner.clone());

        let result = generator.generate(&request(), None).await.unwrap();

        assert_eq!(result.attempts, 2);
        let tokens = runner.tokens();
        assert_ne!(tokens[0], tokens[1]);
        let status = pool.status().await.unwrap();
        assert_eq!(status.failed_count, 1);
    }

    #[tokio::test]
    async fn test_blocked_cap_is_terminal() {
        let pool = pool("a\nb\nc\nd\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![
            blocked(),
            blocked(),
            blocked(),
            success("never"),
        ]));
        let generator = generator(pool, runner.clone());

        let err = generator.generate(&request(), None).await.unwrap_err();

        assert_eq!(err.kind(), "blocked");
        assert_eq!(runner.tokens().len(), 3);
    }

    #[tokio::test]
    async fn test_forced_credential_is_not_rotated() {
        let pool = pool("a\nb\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![rate_limited(), success("img1")]));
        let generator = generator(pool.clone(), runner.clone());

        let err = generator
            .generate(&request().with_credential("pinned-token"), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "rate_limited");
        assert_eq!(runner.tokens(), vec!["pinned-token"]);
    }

    #[tokio::test]
    async fn test_definitive_failure_is_not_retried() {
        let pool = pool("a\nb\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![
            AttemptResult::Upstream {
                code: "content_policy".to_string(),
                message: "refused".to_string(),
            },
            success("img1"),
        ]));
        let generator = generator(pool.clone(), runner.clone());

        let err = generator.generate(&request(), None).await.unwrap_err();

        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(runner.tokens().len(), 1);
        assert_eq!(pool.status().await.unwrap().failed_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let pool = pool("a\nb\nc\nd\ne\nf\n").await;
        let results = (0..5)
            .map(|_| AttemptResult::ConnectionError {
                message: "reset".to_string(),
            })
            .collect();
        let runner = Arc::new(ScriptedRunner::new(results));
        let generator = generator(pool, runner.clone());

        let err = generator.generate(&request(), None).await.unwrap_err();

        assert_eq!(err.kind(), "connection_error");
        assert_eq!(runner.tokens().len(), 5);
    }

    #[tokio::test]
    async fn test_partial_timeout_counts_as_success() {
        let pool = pool("a\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![AttemptResult::Timeout {
            partial_images: vec![saved("img1")],
        }]));
        let generator = generator(pool.clone(), runner);

        let result = generator.generate(&request(), None).await.unwrap();

        assert!(result.partial);
        assert_eq!(pool.status().await.unwrap().keys[0].used_today, 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_no_credential_available() {
        let pool = pool("").await;
        let runner = Arc::new(ScriptedRunner::new(vec![success("img1")]));
        let generator = generator(pool, runner.clone());

        let err = generator.generate(&request(), None).await.unwrap_err();

        assert_eq!(err.kind(), "no_credential_available");
        assert!(runner.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_age_verification_runs_once_and_never_blocks() {
        let pool = pool("a\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![success("img1"), success("img2")]));
        let verifier = Arc::new(CountingVerifier {
            calls: AtomicUsize::new(0),
            accept: true,
        });
        let generator = Generator::new(pool.clone(), runner, verifier.clone(), RetryPolicy::default());

        generator.generate(&request(), None).await.unwrap();
        generator.generate(&request(), None).await.unwrap();

        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        assert!(pool.get_age_verified("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_age_verification_failure_does_not_abort() {
        let pool = pool("a\n").await;
        let runner = Arc::new(ScriptedRunner::new(vec![success("img1")]));
        let verifier = Arc::new(CountingVerifier {
            calls: AtomicUsize::new(0),
            accept: false,
        });
        let generator = Generator::new(pool.clone(), runner, verifier, RetryPolicy::default());

        assert!(generator.generate(&request(), None).await.is_ok());
        assert!(!pool.get_age_verified("a").await.unwrap());
    }
}
