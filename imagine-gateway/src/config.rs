//! Gateway configuration from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use imagine_protocol::{DEFAULT_WS_URL, ProtocolConfig};
use tracing::warn;

use crate::credentials::{DEFAULT_KEY_PREFIX, RotationStrategy};
use crate::generation::{DEFAULT_ASPECT_RATIO, DEFAULT_IMAGE_COUNT, GenerationDefaults, RetryPolicy};
use crate::{Error, Result};

/// Where credential usage is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// JSON document at `state_file`.
    File { state_file: PathBuf },
    /// Shared Redis instance.
    Redis { url: String, key_prefix: String },
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub sso_file: PathBuf,
    pub store: StoreBackend,
    pub rotation_strategy: RotationStrategy,
    pub daily_limit: u32,

    pub images_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Public base URL of stored images; derived from host/port when unset.
    pub base_url: Option<String>,

    pub default_aspect_ratio: String,
    pub default_image_count: usize,
    pub generation_timeout: Duration,
    pub retry: RetryPolicy,

    pub ws_url: String,
    pub cf_clearance: Option<String>,
    /// Proxy for HTTP side calls.
    pub proxy_url: Option<String>,

    pub log_dir: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let sso_file = PathBuf::from("key.txt");
        Self {
            store: StoreBackend::File {
                state_file: default_state_file(&sso_file),
            },
            sso_file,
            rotation_strategy: RotationStrategy::Hybrid,
            daily_limit: 10,
            images_dir: PathBuf::from("data/images"),
            host: "0.0.0.0".to_string(),
            port: 9563,
            base_url: None,
            default_aspect_ratio: DEFAULT_ASPECT_RATIO.to_string(),
            default_image_count: DEFAULT_IMAGE_COUNT,
            generation_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            ws_url: DEFAULT_WS_URL.to_string(),
            cf_clearance: None,
            proxy_url: None,
            log_dir: PathBuf::from("logs"),
        }
    }
}

fn default_state_file(sso_file: &std::path::Path) -> PathBuf {
    sso_file
        .parent()
        .map(|dir| dir.join("sso_state.json"))
        .unwrap_or_else(|| PathBuf::from("sso_state.json"))
}

/// Non-empty, trimmed value of an environment variable.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a variable, falling back to `default` with a warning.
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env_var(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "Invalid value, using default");
            default
        }),
        None => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_var(name).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(var = name, value = %v, "Invalid boolean, using default");
            default
        }
        None => default,
    }
}

impl GatewayConfig {
    /// Build the configuration from environment variables over the defaults.
    ///
    /// Invalid numbers fall back to defaults; an unknown rotation strategy is
    /// an error.
    pub fn from_env_or_default() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = env_var("SSO_FILE") {
            config.sso_file = PathBuf::from(path);
        }
        let state_file = env_var("SSO_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_state_file(&config.sso_file));

        config.store = if env_bool("REDIS_ENABLED", false) {
            StoreBackend::Redis {
                url: env_var("REDIS_URL")
                    .unwrap_or_else(|| "redis://localhost:6379/0".to_string()),
                key_prefix: env_var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            }
        } else {
            StoreBackend::File { state_file }
        };

        if let Some(strategy) = env_var("SSO_ROTATION_STRATEGY") {
            config.rotation_strategy = strategy
                .parse()
                .map_err(|e| Error::config(format!("SSO_ROTATION_STRATEGY: {e}")))?;
        }
        config.daily_limit = env_parse("SSO_DAILY_LIMIT", config.daily_limit);

        if let Some(dir) = env_var("IMAGES_DIR") {
            config.images_dir = PathBuf::from(dir);
        }
        if let Some(host) = env_var("HOST") {
            config.host = host;
        }
        config.port = env_parse("PORT", config.port);
        config.base_url = env_var("BASE_URL");

        if let Some(ratio) = env_var("DEFAULT_ASPECT_RATIO") {
            config.default_aspect_ratio = ratio;
        }
        config.default_image_count =
            env_parse("DEFAULT_IMAGE_COUNT", config.default_image_count).max(1);
        config.generation_timeout = Duration::from_secs(env_parse(
            "GENERATION_TIMEOUT",
            config.generation_timeout.as_secs(),
        ));
        config.retry.max_attempts = env_parse("MAX_RETRIES", config.retry.max_attempts).max(1);
        config.retry.max_blocked_attempts =
            env_parse("MAX_BLOCKED_RETRIES", config.retry.max_blocked_attempts).max(1);

        if let Some(url) = env_var("GROK_WS_URL") {
            config.ws_url = url;
        }
        config.cf_clearance = env_var("CF_CLEARANCE");
        config.proxy_url = env_var("PROXY_URL")
            .or_else(|| env_var("HTTPS_PROXY"))
            .or_else(|| env_var("HTTP_PROXY"));

        if let Some(dir) = env_var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Public base URL for stored images.
    pub fn effective_base_url(&self) -> String {
        if let Some(base_url) = &self.base_url {
            return base_url.trim_end_matches('/').to_string();
        }
        let host = if self.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        format!("http://{}:{}", host, self.port)
    }

    pub fn generation_defaults(&self) -> GenerationDefaults {
        GenerationDefaults {
            aspect_ratio: self.default_aspect_ratio.clone(),
            image_count: self.default_image_count,
        }
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig::default()
            .with_ws_url(self.ws_url.clone())
            .with_attempt_timeout(self.generation_timeout)
    }
}
