//! Shared HTTP transport.

use std::time::Duration;

use parley_types::ApiError;

/// Connection-pool settings for the shared HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Idle connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept before closing.
    pub pool_idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 16,
            pool_idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Build a connection-reusing HTTP client. Clones share one pool.
pub fn build_http_client(config: &HttpConfig) -> Result<reqwest::Client, ApiError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|e| ApiError::Network(e.to_string()))
}
