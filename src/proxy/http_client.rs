// Shared reqwest client builder.
// One pooled client per process; per-phase timeouts are applied at call sites
// (header wait, inter-chunk idle) because reqwest only models connect + total.

use std::time::Duration;

use crate::proxy::config::ProxyConfig;

/// Build the upstream HTTP client from the proxy config.
pub fn build_http_client(config: &ProxyConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_deadline)
        .build()
}

/// Client used for token refresh calls — same connect timeout, shorter total.
pub fn build_refresh_client(config: &ProxyConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(Duration::from_secs(30))
        .build()
}
