//! Runtime configuration.

use std::time::Duration;

use crate::error::{HostError, HostResult};

/// Tunables for a bridge host.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on pooled virtual machines.
    pub pool_capacity: usize,
    /// Depth of the job queue feeding the context thread.
    pub job_queue_depth: usize,
    /// How long the context thread sleeps on an empty job queue between
    /// reactor drains.
    pub drain_interval: Duration,
    /// User agent sent with outbound HTTP requests.
    pub http_user_agent: String,
    /// Overall deadline for outbound HTTP requests without an explicit
    /// per-request timeout.
    pub http_timeout: Duration,
    /// Upper bound on a fetched response body. Bodies are read as a stream
    /// and the transfer fails once the bound is crossed.
    pub http_max_response_bytes: usize,
    /// Default deadline for blocking native calls into the guest.
    pub call_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4,
            job_queue_depth: 64,
            drain_interval: Duration::from_millis(10),
            http_user_agent: concat!("tonbridge/", env!("CARGO_PKG_VERSION")).to_string(),
            http_timeout: Duration::from_secs(30),
            http_max_response_bytes: 10 * 1024 * 1024,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> HostResult<()> {
        if self.pool_capacity == 0 {
            return Err(HostError::config("pool_capacity must be at least 1"));
        }
        if self.job_queue_depth == 0 {
            return Err(HostError::config("job_queue_depth must be at least 1"));
        }
        if self.drain_interval.is_zero() {
            return Err(HostError::config("drain_interval must be positive"));
        }
        if self.http_max_response_bytes == 0 {
            return Err(HostError::config(
                "http_max_response_bytes must be at least 1",
            ));
        }
        Ok(())
    }

    /// Build the HTTP client used by the fetch and event-stream surfaces.
    pub fn http_client(&self) -> HostResult<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.http_user_agent)
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| HostError::http(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn degenerate_values_are_rejected() {
        let mut config = RuntimeConfig::default();
        config.pool_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.job_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.drain_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.http_max_response_bytes = 0;
        assert!(config.validate().is_err());
    }
}
