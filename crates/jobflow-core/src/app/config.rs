//! Engine configuration: defaults for policies a task does not set itself.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::{DependencyWait, OnTimeout};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub dependency_poll_timeout_ms: u64,
    pub dependency_poll_interval_ms: u64,
    pub dependency_reschedule_delay_ms: u64,
    pub dependency_on_timeout: OnTimeout,
    pub throttle_ttl_ms: u64,
    pub throttle_poll_interval_ms: u64,
    pub worker_count: usize,
    pub lease_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dependency_poll_timeout_ms: 5_000,
            dependency_poll_interval_ms: 1_000,
            dependency_reschedule_delay_ms: 5_000,
            dependency_on_timeout: OnTimeout::Reschedule,
            throttle_ttl_ms: 180_000,
            throttle_poll_interval_ms: 1_000,
            worker_count: 2,
            lease_poll_interval_ms: 50,
        }
    }
}

const ENV_PREFIX: &str = "JOBFLOW_";

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read `JOBFLOW_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{}", name.to_ascii_uppercase());
            lookup(&key).map(|value| (key, value))
        };

        set_parsed(&mut cfg.dependency_poll_timeout_ms, get("dependency_poll_timeout_ms"))?;
        set_parsed(&mut cfg.dependency_poll_interval_ms, get("dependency_poll_interval_ms"))?;
        set_parsed(
            &mut cfg.dependency_reschedule_delay_ms,
            get("dependency_reschedule_delay_ms"),
        )?;
        set_parsed(&mut cfg.throttle_ttl_ms, get("throttle_ttl_ms"))?;
        set_parsed(&mut cfg.throttle_poll_interval_ms, get("throttle_poll_interval_ms"))?;
        set_parsed(&mut cfg.worker_count, get("worker_count"))?;
        set_parsed(&mut cfg.lease_poll_interval_ms, get("lease_poll_interval_ms"))?;

        if let Some((key, value)) = get("dependency_on_timeout") {
            cfg.dependency_on_timeout = match value.trim() {
                "reschedule" => OnTimeout::Reschedule,
                "fail" => OnTimeout::Fail,
                _ => return Err(ConfigError::InvalidValue { key, value }),
            };
        }
        Ok(cfg)
    }

    /// Engine-wide dependency wait policy.
    pub fn dependency_wait(&self) -> DependencyWait {
        DependencyWait {
            poll_timeout: Duration::from_millis(self.dependency_poll_timeout_ms),
            poll_interval: Duration::from_millis(self.dependency_poll_interval_ms),
            reschedule_delay: Duration::from_millis(self.dependency_reschedule_delay_ms),
            on_timeout: self.dependency_on_timeout,
        }
    }

    pub fn throttle_ttl(&self) -> Duration {
        Duration::from_millis(self.throttle_ttl_ms)
    }

    pub fn throttle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_poll_interval_ms)
    }

    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_interval_ms)
    }
}

fn set_parsed<T: std::str::FromStr>(
    slot: &mut T,
    found: Option<(String, String)>,
) -> Result<(), ConfigError> {
    if let Some((key, value)) = found {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        let wait = cfg.dependency_wait();
        assert_eq!(wait.poll_timeout, Duration::from_secs(5));
        assert_eq!(wait.poll_interval, Duration::from_secs(1));
        assert_eq!(wait.reschedule_delay, Duration::from_secs(5));
        assert_eq!(wait.on_timeout, OnTimeout::Reschedule);
        assert_eq!(cfg.throttle_ttl(), Duration::from_secs(180));
        assert_eq!(cfg.worker_count, 2);
    }

    #[test]
    fn json_overrides_some_fields() {
        let cfg = EngineConfig::from_json_str(
            r#"{"worker_count": 8, "dependency_on_timeout": "fail"}"#,
        )
        .unwrap();
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.dependency_on_timeout, OnTimeout::Fail);
        assert_eq!(cfg.throttle_ttl_ms, 180_000);
    }

    #[test]
    fn json_rejects_unknown_fields() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"workers": 8}"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn lookup_reads_prefixed_variables() {
        let vars = HashMap::from([
            ("JOBFLOW_WORKER_COUNT", "4"),
            ("JOBFLOW_DEPENDENCY_POLL_INTERVAL_MS", " 250 "),
            ("JOBFLOW_DEPENDENCY_ON_TIMEOUT", "fail"),
        ]);
        let cfg = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.dependency_poll_interval_ms, 250);
        assert_eq!(cfg.dependency_on_timeout, OnTimeout::Fail);
        assert_eq!(cfg.lease_poll_interval_ms, 50);
    }

    #[test]
    fn lookup_rejects_unparsable_values() {
        let err = EngineConfig::from_lookup(|k| {
            (k == "JOBFLOW_THROTTLE_TTL_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "JOBFLOW_THROTTLE_TTL_MS"));
    }
}
