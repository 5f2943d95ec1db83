//! Dependency wait policy: how a task blocks on dispatched map tasks it
//! depends on.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::WorkflowError;

/// What to do when `poll_timeout` elapses and dependencies are still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    /// Re-enqueue the current unit of work after `reschedule_delay`.
    #[default]
    Reschedule,
    /// Fail the run with `DependencyTimeout`.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyWait {
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub reschedule_delay: Duration,
    pub on_timeout: OnTimeout,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyWaitConfig {
    poll_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    reschedule_delay_ms: Option<u64>,
    on_timeout: Option<OnTimeout>,
}

impl Default for DependencyWait {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            reschedule_delay: Duration::from_secs(5),
            on_timeout: OnTimeout::Reschedule,
        }
    }
}

impl DependencyWait {
    /// Build a policy from an object value; absent fields fall back to `base`.
    pub fn from_value(value: &serde_json::Value, base: DependencyWait) -> Result<Self, WorkflowError> {
        if !value.is_object() {
            return Err(WorkflowError::InvalidDependencyWaitConfig(format!(
                "expected an object, got {value}"
            )));
        }
        let cfg: DependencyWaitConfig = serde_json::from_value(value.clone())
            .map_err(|e| WorkflowError::InvalidDependencyWaitConfig(e.to_string()))?;

        let policy = Self {
            poll_timeout: cfg
                .poll_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.poll_timeout),
            poll_interval: cfg
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.poll_interval),
            reschedule_delay: cfg
                .reschedule_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.reschedule_delay),
            on_timeout: cfg.on_timeout.unwrap_or(base.on_timeout),
        };

        if policy.poll_interval.is_zero() && !policy.poll_timeout.is_zero() {
            return Err(WorkflowError::InvalidDependencyWaitConfig(
                "poll_interval must be greater than zero when poll_timeout is set".to_string(),
            ));
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_fields_fall_back_to_base() {
        let policy =
            DependencyWait::from_value(&json!({"on_timeout": "fail"}), DependencyWait::default())
                .unwrap();
        assert_eq!(policy.on_timeout, OnTimeout::Fail);
        assert_eq!(policy.poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn explicit_fields_override() {
        let policy = DependencyWait::from_value(
            &json!({"poll_timeout_ms": 0, "reschedule_delay_ms": 30000}),
            DependencyWait::default(),
        )
        .unwrap();
        assert_eq!(policy.poll_timeout, Duration::ZERO);
        assert_eq!(policy.reschedule_delay, Duration::from_secs(30));
    }

    #[test]
    fn zero_interval_with_timeout_is_rejected() {
        let err = DependencyWait::from_value(
            &json!({"poll_interval_ms": 0}),
            DependencyWait::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDependencyWaitConfig(_)));
    }

    #[test]
    fn non_object_is_rejected() {
        let err = DependencyWait::from_value(&json!(10), DependencyWait::default()).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDependencyWaitConfig(_)));
    }
}
