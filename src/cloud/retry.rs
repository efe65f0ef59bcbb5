//! Retry policy
//!
//! Pure, table-driven retry decisions. Callers report the error they hit and
//! how many attempts they have made; the policy answers whether to try again
//! and how long to wait. No I/O happens here.

use crate::error::{ErrorKind, HubError};
use std::time::Duration;

/// Exponential backoff with a bounded interval and optional attempt cap
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None = retry forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Retry { attempt: u32, delay: Duration },
    /// Error is not retryable
    Fail(ErrorKind),
    /// Caller asked to stop
    AbortShutdownRequested,
    /// Attempt cap reached
    AbortMaxAttemptsExceeded,
}

impl RetryPolicy {
    /// Delay before the 1-based `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Sum of all delays when the attempt count is bounded
    pub fn max_total_delay(&self) -> Option<Duration> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.delay_for_attempt(attempt))
                .sum()
        })
    }

    /// Decide what to do after `attempts_made` failed attempts ending in `error`
    pub fn decide(
        &self,
        error: &HubError,
        attempts_made: u32,
        shutdown_requested: bool,
    ) -> RetryDecision {
        if shutdown_requested || matches!(error, HubError::Cancelled) {
            return RetryDecision::AbortShutdownRequested;
        }

        if !error.is_retryable() {
            return RetryDecision::Fail(error.kind());
        }

        if let Some(max_attempts) = self.max_attempts {
            if attempts_made >= max_attempts {
                return RetryDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = attempts_made + 1;
        RetryDecision::Retry {
            attempt,
            delay: self.delay_for_attempt(attempt),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.max_attempts {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if self.initial_delay.is_zero() {
            return Err("initial backoff must be greater than 0".to_string());
        }

        if self.max_delay < self.initial_delay {
            return Err("max backoff must not be smaller than initial backoff".to_string());
        }

        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err("backoff multiplier must be at least 1.0".to_string());
        }

        Ok(())
    }
}
