//! Retry budgets and exponential backoff.
//!
//! Each retryable step (import, notify) has its own [`RetryPolicy`]. The
//! delay before attempt `n + 1` is
//!
//! ```text
//! delay(n) = min(base · multiplier^(n-1), max)
//! ```
//!
//! where `n >= 1` is the number of attempts already made. There is no
//! jitter, so the schedule is fully determined by the policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Budget and backoff curve for one step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations of the step, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Import defaults: 5 attempts, 1 minute doubling to at most 16 minutes.
    pub fn import_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 60_000,
            multiplier: 2.0,
            max_delay_ms: 16 * 60_000,
        }
    }

    /// Notify defaults: 4 attempts, 1 day doubling to at most 4 days.
    pub fn notify_default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 86_400_000,
            multiplier: 2.0,
            max_delay_ms: 4 * 86_400_000,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `attempts_made` invocations.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait after the `attempts_made`-th failed invocation.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// The full sequence of delays a step can wait through before its
    /// budget is exhausted (`max_attempts - 1` entries).
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|n| self.delay_after(n)).collect()
    }

    /// Check the invariants the backoff curve relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than zero".to_string());
        }
        if !(self.multiplier.is_finite() && self.multiplier > 1.0) {
            return Err(format!(
                "multiplier must be greater than 1.0, got {}",
                self.multiplier
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        Ok(())
    }
}

/// The independent budgets of the two retryable steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub import: RetryPolicy,
    pub notify: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            import: RetryPolicy::import_default(),
            notify: RetryPolicy::notify_default(),
        }
    }
}
