//! Retry classification and exponential backoff for chat requests.

use std::collections::HashSet;
use std::time::Duration;

use parley_types::{ApiError, CallContext};
use rand::Rng;

/// Substrings that mark an unstructured error as a transient network failure.
const NETWORK_ERROR_MARKERS: [&str; 3] = ["connection", "timeout", "network"];

/// Configuration for retry behavior on transient errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub exponent_base: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter_max: Duration,
    /// HTTP status codes that are always retried.
    pub retryable_status_codes: HashSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponent_base: 2.0,
            jitter_max: Duration::from_secs(1),
            retryable_status_codes: HashSet::from([429, 500, 502, 503, 504]),
        }
    }
}

/// Decides whether a failed attempt is retried and how long to wait first.
///
/// Read-only after construction; share it freely across tasks.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Returns `true` if the attempt at index `attempt` (0-based) failed with a
    /// transient error and another attempt is still allowed.
    pub fn should_retry(&self, error: &ApiError, attempt: u32) -> bool {
        if attempt >= self.config.max_retries {
            return false;
        }

        match error {
            ApiError::Cancelled | ApiError::DeadlineExceeded => false,
            ApiError::Status {
                status, retryable, ..
            } => *retryable || self.config.retryable_status_codes.contains(status),
            other => {
                let text = other.to_string().to_lowercase();
                NETWORK_ERROR_MARKERS
                    .iter()
                    .any(|marker| text.contains(marker))
            }
        }
    }

    /// Delay before the retry following attempt `attempt`:
    /// `base_delay * exponent_base^attempt + uniform(0, jitter_max)`, clamped
    /// to `max_delay`.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut base =
            self.config.base_delay.as_secs_f64() * self.config.exponent_base.powi(exponent);
        // 0 * inf
        if base.is_nan() {
            base = 0.0;
        }

        let jitter_max = self.config.jitter_max.as_secs_f64();
        let jitter = if jitter_max > 0.0 {
            rand::rng().random_range(0.0..=jitter_max)
        } else {
            0.0
        };

        let max = self.config.max_delay.as_secs_f64();
        let delay = (base + jitter).min(max);
        if delay.is_nan() || delay <= 0.0 {
            return Duration::ZERO;
        }
        // `max_delay` near `Duration::MAX` does not survive the f64 round trip.
        Duration::try_from_secs_f64(delay).unwrap_or(self.config.max_delay)
    }
}

/// Sleep for `delay`, returning early with the context's error if it is
/// cancelled or expires first.
pub async fn sleep_with_context(ctx: &CallContext, delay: Duration) -> Result<(), ApiError> {
    if let Some(err) = ctx.error() {
        return Err(err);
    }
    tokio::select! {
        biased;
        err = ctx.done() => Err(err),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
