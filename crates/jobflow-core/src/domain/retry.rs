//! Retry policy for task bodies: decides how many times a body is retried
//! and how long to wait between attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::WorkflowError;

/// Backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Retry policy of one task.
///
/// `count` is the number of retries after the first attempt, so a body runs
/// at most `count + 1` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRetry {
    pub count: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub jitter: bool,
}

/// Object form accepted by [`TaskRetry::from_value`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryConfig {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    strategy: RetryStrategy,
    #[serde(default = "default_base_delay_ms")]
    base_delay_ms: u64,
    #[serde(default)]
    jitter: bool,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for TaskRetry {
    fn default() -> Self {
        Self::none()
    }
}

impl TaskRetry {
    /// No retry: the body runs exactly once.
    pub fn none() -> Self {
        Self {
            count: 0,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_millis(default_base_delay_ms()),
            jitter: false,
        }
    }

    pub fn new(count: u32) -> Self {
        Self {
            count,
            ..Self::none()
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build a policy from a loosely shaped config value.
    ///
    /// Accepts an integer (`3` = three retries with defaults) or an object
    /// `{"count", "strategy", "base_delay_ms", "jitter"}`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, WorkflowError> {
        match value {
            serde_json::Value::Number(n) => {
                let count = n
                    .as_u64()
                    .and_then(|c| u32::try_from(c).ok())
                    .ok_or_else(|| {
                        WorkflowError::InvalidRetryConfig(format!(
                            "retry count must be a non-negative integer, got {n}"
                        ))
                    })?;
                Ok(Self::new(count))
            }
            serde_json::Value::Object(_) => {
                let cfg: RetryConfig = serde_json::from_value(value.clone())
                    .map_err(|e| WorkflowError::InvalidRetryConfig(e.to_string()))?;
                Ok(Self {
                    count: cfg.count,
                    strategy: cfg.strategy,
                    base_delay: Duration::from_millis(cfg.base_delay_ms),
                    jitter: cfg.jitter,
                })
            }
            other => Err(WorkflowError::InvalidRetryConfig(format!(
                "expected an integer or an object, got {other}"
            ))),
        }
    }

    /// Maximum number of body executions.
    pub fn max_attempts(&self) -> u32 {
        self.count.saturating_add(1)
    }

    /// Delay to wait after the `attempt`-th failure (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter && !delay.is_zero() {
            // up to +50% of the computed delay
            let extra = rand::thread_rng().gen_range(0.0..0.5);
            delay + delay.mul_f64(extra)
        } else {
            delay
        }
    }

    fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}
