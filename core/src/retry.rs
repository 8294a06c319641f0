//! Retry policy for the request executor.
//!
//! The policy is plain data plus two pure functions, so the attempt limit
//! and the backoff curve can be tested without any I/O.

use std::time::Duration;

use rand::Rng;

use crate::config::ClientConfig;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `1 + max_retries`.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound of the random term added to each delay. Clamped to half
    /// of `base_delay` so successive delays never shrink.
    pub jitter: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.retry_count,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether a failed attempt number `attempt` (1-based) gets another try.
    pub fn should_retry(&self, kind: ErrorKind, retryable: bool, attempt: u32) -> bool {
        retryable && kind.is_transient() && attempt < self.max_attempts()
    }

    /// Delay before retry number `retry` (1-based), with random jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_with(retry, rand::thread_rng().gen_range(0.0..=1.0))
    }

    /// Deterministic form of `backoff`; `sample` is in `[0, 1]`.
    pub fn backoff_with(&self, retry: u32, sample: f64) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let exponential = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_cap = self.jitter.min(self.base_delay / 2);
        let jitter = jitter_cap.mul_f64(sample.clamp(0.0, 1.0));
        (exponential + jitter).min(self.max_delay)
    }
}
