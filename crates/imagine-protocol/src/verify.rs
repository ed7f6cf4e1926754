//! One-time age verification for a session token.
//!
//! The upstream refuses some prompts until the account has a birth date on
//! record. Verification is best-effort: failures are logged and generation
//! proceeds regardless.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use tracing::{error, info, warn};

use crate::config::DEFAULT_ORIGIN;
use crate::error::{ProtocolError, Result};
use crate::http::build_http_client;

/// Endpoint that records the account birth date.
pub const SET_BIRTH_DATE_URL: &str = "https://grok.com/rest/auth/set-birth-date";

const BIRTH_DATE: &str = "2001-01-01T16:00:00.000Z";

const VERIFY_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36";

/// Side call that marks a token's account as age-verified.
#[async_trait]
pub trait AgeVerifier: Send + Sync {
    /// Returns `Ok(true)` when the upstream accepted the verification.
    async fn verify(&self, token: &str) -> Result<bool>;
}

/// Verifier that never contacts the upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAgeVerifier;

#[async_trait]
impl AgeVerifier for NoopAgeVerifier {
    async fn verify(&self, _token: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Verifier backed by the upstream REST endpoint.
pub struct HttpAgeVerifier {
    client: reqwest::Client,
    cf_clearance: Option<String>,
    endpoint: String,
}

impl HttpAgeVerifier {
    pub fn new(cf_clearance: Option<String>, proxy_url: Option<&str>) -> Self {
        Self {
            client: build_http_client(proxy_url, Duration::from_secs(30)),
            cf_clearance: cf_clearance.filter(|c| !c.trim().is_empty()),
            endpoint: SET_BIRTH_DATE_URL.to_string(),
        }
    }

    /// Point the verifier at a different endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn headers(&self, token: &str, cf_clearance: &str) -> Result<HeaderMap> {
        let cookie = format!("sso={token}; sso-rw={token}; cf_clearance={cf_clearance}");
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(VERIFY_USER_AGENT));
        headers.insert(ORIGIN, HeaderValue::from_static(DEFAULT_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://grok.com/"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&cookie)
                .map_err(|e| ProtocolError::other(format!("Invalid cookie header: {e}")))?,
        );
        Ok(headers)
    }
}

#[async_trait]
impl AgeVerifier for HttpAgeVerifier {
    async fn verify(&self, token: &str) -> Result<bool> {
        let Some(cf_clearance) = self.cf_clearance.as_deref() else {
            warn!("CF_CLEARANCE not configured, skipping age verification");
            return Ok(false);
        };

        info!("Running age verification");
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers(token, cf_clearance)?)
            .json(&serde_json::json!({ "birthDate": BIRTH_DATE }))
            .send()
            .await
            .inspect_err(|e| error!(error = %e, "Age verification request failed"))?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            info!(status = %status, "Age verification succeeded");
            return Ok(true);
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        warn!(status = %status, body = %snippet, "Age verification rejected");
        Ok(false)
    }
}
