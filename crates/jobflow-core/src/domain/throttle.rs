//! Throttle policy and the semaphore request it resolves to.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::WorkflowError;

/// A named, time-bounded concurrency ticket description.
///
/// This is not a lock. It is a request consumed by the queue's admission
/// control (`Queue::acquire_permit` / `release_permit`, or the queue's own
/// check before leasing a dispatched unit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semaphore {
    pub concurrency_key: String,

    /// `None` means no limit: acquisition always passes.
    pub concurrency_limit: Option<u32>,

    /// TTL of a granted permit; the queue expires leaked permits after it.
    #[serde(with = "duration_ms")]
    pub concurrency_duration: Duration,
}

impl Semaphore {
    pub fn new(key: impl Into<String>, limit: Option<u32>, duration: Duration) -> Self {
        Self {
            concurrency_key: key.into(),
            concurrency_limit: limit,
            concurrency_duration: duration,
        }
    }

    pub fn unlimited(key: impl Into<String>) -> Self {
        Self::new(key, None, Duration::ZERO)
    }

    pub fn is_limited(&self) -> bool {
        self.concurrency_limit.is_some()
    }
}

/// Throttle declared on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskThrottle {
    pub key: Option<String>,
    pub limit: u32,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThrottleConfig {
    #[serde(default)]
    key: Option<String>,
    limit: u32,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

impl TaskThrottle {
    pub fn new(limit: u32) -> Self {
        Self {
            key: None,
            limit,
            ttl: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Build a throttle from a loosely shaped config value.
    ///
    /// Accepts an integer (the limit) or an object `{"key", "limit", "ttl_ms"}`.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, WorkflowError> {
        let throttle = match value {
            serde_json::Value::Number(n) => {
                let limit = n
                    .as_u64()
                    .and_then(|l| u32::try_from(l).ok())
                    .ok_or_else(|| {
                        WorkflowError::InvalidThrottleConfig(format!(
                            "throttle limit must be a positive integer, got {n}"
                        ))
                    })?;
                Self::new(limit)
            }
            serde_json::Value::Object(_) => {
                let cfg: ThrottleConfig = serde_json::from_value(value.clone())
                    .map_err(|e| WorkflowError::InvalidThrottleConfig(e.to_string()))?;
                Self {
                    key: cfg.key,
                    limit: cfg.limit,
                    ttl: cfg.ttl_ms.map(Duration::from_millis),
                }
            }
            other => {
                return Err(WorkflowError::InvalidThrottleConfig(format!(
                    "expected an integer or an object, got {other}"
                )));
            }
        };

        if throttle.limit == 0 {
            return Err(WorkflowError::InvalidThrottleConfig(
                "throttle limit must be greater than zero".to_string(),
            ));
        }
        Ok(throttle)
    }

    /// Resolve the semaphore for this throttle.
    ///
    /// Without an explicit key, `default_key` (`<workflow>:<task>`) is used;
    /// without an explicit ttl, `default_ttl` is used.
    pub fn semaphore(&self, default_key: &str, default_ttl: Duration) -> Semaphore {
        Semaphore::new(
            self.key.clone().unwrap_or_else(|| default_key.to_string()),
            Some(self.limit),
            self.ttl.unwrap_or(default_ttl),
        )
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
