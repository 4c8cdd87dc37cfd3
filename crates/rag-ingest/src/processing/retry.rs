//! Error classification and exponential backoff for batch retries

use std::time::Duration;

use crate::config::ProcessingConfig;
use crate::error::Error;

/// Substrings (lowercase) that mark an error as transient
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "reset",
    "broken pipe",
    "429",
    "too many requests",
    "rate limit",
    "temporary",
    "unavailable",
];

/// Whether an error is worth retrying
///
/// Classification is by message so that provider errors from any backend
/// (HTTP status text, socket errors, our own deadlines) are recognized the
/// same way.
pub fn is_retryable(error: &Error) -> bool {
    if matches!(error, Error::Timeout { .. }) {
        return true;
    }
    let message = error.to_string().to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Retry limits and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay())
    }

    /// Delay before retry number `retry` (zero-based) of batch `batch_index`
    ///
    /// `base * 2^retry` plus a per-batch offset of `base / 10 * (batch_index % 5)`
    /// so batches that failed together do not retry in lockstep.
    pub fn delay_for(&self, retry: u32, batch_index: usize) -> Duration {
        let factor = 1u32.checked_shl(retry.min(20)).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(factor);
        let jitter = (self.base_delay / 10).saturating_mul((batch_index % 5) as u32);
        backoff.saturating_add(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}
