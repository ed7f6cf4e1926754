//! Shared TLS and HTTP client setup.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::{debug, warn};

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Apply an optional explicit proxy to a `reqwest::ClientBuilder`.
///
/// - `None` => reqwest defaults (system/env proxy)
/// - `Some(url)` => route all traffic through `url`; an invalid URL disables proxying
pub fn apply_proxy(builder: reqwest::ClientBuilder, proxy_url: Option<&str>) -> reqwest::ClientBuilder {
    let Some(url) = proxy_url.map(str::trim).filter(|s| !s.is_empty()) else {
        return builder;
    };

    match reqwest::Proxy::all(url) {
        Ok(proxy) => builder.proxy(proxy),
        Err(error) => {
            warn!(proxy_url = %url, error = %error, "Invalid proxy URL; disabling proxy");
            builder.no_proxy()
        }
    }
}

/// Build the HTTP client used for side calls to the upstream.
pub fn build_http_client(proxy_url: Option<&str>, request_timeout: Duration) -> reqwest::Client {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder();
    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }
    builder = apply_proxy(builder, proxy_url);

    builder.build().unwrap_or_else(|error| {
        warn!(error = %error, "Failed to create HTTP client; falling back to reqwest defaults");
        reqwest::Client::new()
    })
}
