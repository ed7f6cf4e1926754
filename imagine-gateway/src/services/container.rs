//! Service container for dependency injection.
//!
//! The ServiceContainer holds references to all application services
//! and manages their lifecycle.

use std::sync::Arc;

use imagine_protocol::{AgeVerifier, AttemptRunner, FsImageSink, HttpAgeVerifier, ProtocolClient};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::{GatewayConfig, StoreBackend};
use crate::credentials::{
    CredentialPool, CredentialStore, FileCredentialStore, KvCredentialStore, PoolConfig, RedisKv,
    SystemClock,
};
use crate::generation::{GenerationDefaults, GenerationRequest, Generator};
use crate::images::ImageLibrary;

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Credential pool shared by every generation.
    pub pool: Arc<CredentialPool>,
    /// Retrying generator.
    pub generator: Arc<Generator>,
    /// Stored image listing.
    pub images: ImageLibrary,
    defaults: GenerationDefaults,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create the container from configuration, connecting to the usage store
    /// and loading the token file.
    pub async fn new(config: &GatewayConfig) -> Result<Self> {
        info!("Initializing service container");

        let store = open_store(&config.store).await?;

        let pool = Arc::new(CredentialPool::new(
            PoolConfig {
                strategy: config.rotation_strategy,
                daily_limit: config.daily_limit,
                source: Some(config.sso_file.clone()),
            },
            store,
            Arc::new(SystemClock),
        ));
        let loaded = pool.reload().await?;
        if loaded == 0 {
            warn!(path = %config.sso_file.display(), "No credentials loaded");
        }

        let base_url = config.effective_base_url();
        let sink = Arc::new(FsImageSink::new(&config.images_dir, base_url.clone()));
        let runner: Arc<dyn AttemptRunner> =
            Arc::new(ProtocolClient::new(config.protocol_config(), sink));
        let verifier: Arc<dyn AgeVerifier> = Arc::new(HttpAgeVerifier::new(
            config.cf_clearance.clone(),
            config.proxy_url.as_deref(),
        ));

        let container = Self::from_parts(
            pool,
            runner,
            verifier,
            config,
            ImageLibrary::new(&config.images_dir, base_url),
        );

        info!(
            credentials = loaded,
            strategy = %config.rotation_strategy,
            images_dir = %config.images_dir.display(),
            "Service container initialized"
        );
        Ok(container)
    }

    /// Assemble a container from already-built parts.
    pub fn from_parts(
        pool: Arc<CredentialPool>,
        runner: Arc<dyn AttemptRunner>,
        verifier: Arc<dyn AgeVerifier>,
        config: &GatewayConfig,
        images: ImageLibrary,
    ) -> Self {
        let generator = Arc::new(Generator::new(pool.clone(), runner, verifier, config.retry));
        Self {
            pool,
            generator,
            images,
            defaults: config.generation_defaults(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// A request for `prompt` carrying the configured defaults.
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(prompt, &self.defaults)
    }

    /// Get the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Cancel background work and release the usage store.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        if let Err(e) = self.pool.close().await {
            warn!(error = %e, "Failed to close credential store");
        }
        info!("Services shut down");
    }
}

async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match backend {
        StoreBackend::File { state_file } => {
            Arc::new(FileCredentialStore::open(state_file.clone()).await?)
        }
        StoreBackend::Redis { url, key_prefix } => {
            let kv = RedisKv::connect(url).await?;
            Arc::new(KvCredentialStore::new(kv, key_prefix.clone()))
        }
    };
    info!(backend = store.backend(), "Opened credential store");
    Ok(store)
}
