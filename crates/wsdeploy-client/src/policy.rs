//! Retry, throttle and polling policy
//!
//! Every constant the invoker uses to decide when and how long to wait lives
//! here, with defaults that configuration can override field by field.

use std::time::Duration;

use rand::Rng;

use crate::error::InvokeError;

/// Returned for a short while after an item is deleted, until its name is released
pub const ITEM_NAME_IN_USE: &str = "ItemDisplayNameAlreadyInUse";

/// Retry/backoff parameters for the request invoker
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after a 429 before giving up
    pub max_throttle_retries: u32,
    /// Wait applied when a 429 carries no Retry-After header
    pub default_retry_after: Duration,
    /// Added on top of every throttle wait
    pub throttle_padding: Duration,
    /// Total attempts allowed across 5xx responses and transport failures
    pub max_transient_attempts: u32,
    /// First transient backoff step
    pub base_delay: Duration,
    /// Ceiling for a single transient backoff step
    pub max_delay: Duration,
    /// Random spread applied to transient backoff, as a fraction of the delay
    pub jitter_ratio: f64,
    /// Poll interval when the server suggests none
    pub poll_interval: Duration,
    /// Polls allowed before a long-running operation is abandoned
    pub max_poll_attempts: u32,
    /// API error codes on a 4xx that are retried like a server error.
    /// Empty by default, so every other 4xx stays terminal.
    pub retryable_error_codes: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_throttle_retries: 5,
            default_retry_after: Duration::from_secs(10),
            throttle_padding: Duration::ZERO,
            max_transient_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: 300,
            retryable_error_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy with every wait set to zero, for tests and dry runs
    pub fn immediate() -> Self {
        RetryPolicy {
            default_retry_after: Duration::ZERO,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
            poll_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Copy of this policy with both retry limits replaced by `max_retries`.
    ///
    /// The transient limit counts attempts rather than retries, hence the +1.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        RetryPolicy {
            max_throttle_retries: max_retries,
            max_transient_attempts: max_retries.saturating_add(1),
            ..self.clone()
        }
    }

    /// Copy of this policy that also retries 4xx responses carrying `code`
    pub fn retrying_error_code(&self, code: impl Into<String>) -> Self {
        let mut policy = self.clone();
        policy.retryable_error_codes.push(code.into());
        policy
    }

    pub fn retries_error_code(&self, code: &str) -> bool {
        self.retryable_error_codes.iter().any(|known| known == code)
    }

    /// Reject values that would make the invoker loop forever or never try
    pub fn validate(&self) -> Result<(), InvokeError> {
        if self.max_transient_attempts == 0 {
            return Err(InvokeError::InvalidPolicy(
                "max_transient_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_poll_attempts == 0 {
            return Err(InvokeError::InvalidPolicy(
                "max_poll_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(InvokeError::InvalidPolicy(format!(
                "jitter_ratio must be within 0.0..=1.0, got {}",
                self.jitter_ratio
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(InvokeError::InvalidPolicy(
                "base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait before the next attempt after `failures` consecutive transient failures
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        apply_jitter(raw.min(self.max_delay), self.jitter_ratio)
    }

    /// Wait after a 429, honouring the server's Retry-After when given
    pub fn throttle_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(self.default_retry_after)
            .saturating_add(self.throttle_padding)
    }

    /// Wait before the next long-running operation poll
    pub fn poll_delay(&self, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or(self.poll_interval)
    }
}

fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    delay.mul_f64(factor)
}

/// Parse a Retry-After header given in (possibly fractional) seconds.
///
/// HTTP-date values are not used by the platform and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}
