//! Tunable protocol parameters.
//!
//! The stage thresholds and blocked-detection windows are inferred from
//! observed upstream behavior, not from a documented contract. They are
//! kept here so they can be adjusted without touching the state machine.

use std::time::Duration;

/// Upstream WebSocket endpoint.
pub const DEFAULT_WS_URL: &str = "wss://grok.com/ws/imagine/listen";

/// Origin sent with every upstream request.
pub const DEFAULT_ORIGIN: &str = "https://grok.com";

/// Browser user agent sent with the WebSocket upgrade.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Configuration for a single generation attempt.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// WebSocket endpoint.
    pub ws_url: String,
    /// `Origin` header value.
    pub origin: String,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Hard deadline for one attempt, independent of message arrival.
    pub attempt_timeout: Duration,
    /// How long the receive loop waits for a frame before running idle checks.
    pub idle_poll_interval: Duration,
    /// Message-driven blocked check: time since the first medium delivery.
    pub blocked_after_medium: Duration,
    /// Idle-driven blocked check (stricter than the message-driven one).
    pub idle_blocked_after_medium: Duration,
    /// With at least one final image, silence longer than this completes the attempt.
    pub idle_completion_after: Duration,
    /// Payloads longer than this are at least `medium`.
    pub medium_min_bytes: usize,
    /// `.jpg` payloads longer than this are `final`.
    pub final_min_bytes: usize,
    /// Value of the `enable_nsfw` request property.
    pub enable_nsfw: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            attempt_timeout: Duration::from_secs(120),
            idle_poll_interval: Duration::from_secs(5),
            blocked_after_medium: Duration::from_secs(15),
            idle_blocked_after_medium: Duration::from_secs(10),
            idle_completion_after: Duration::from_secs(10),
            medium_min_bytes: 30_000,
            final_min_bytes: 100_000,
            enable_nsfw: true,
        }
    }
}

impl ProtocolConfig {
    /// Override the hard attempt deadline.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Override the WebSocket endpoint.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }
}
