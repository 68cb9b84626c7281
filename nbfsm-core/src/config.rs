//! Machine configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// How the engine reacts when an action returns [`ActionError::Failed`].
///
/// [`ActionError::Failed`]: crate::ActionError::Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and carry on with the transition.
    #[default]
    Continue,
    /// Log the failure and stop the machine.
    Stop,
}

/// Settings of a single machine.
///
/// Durations deserialize from human readable strings such as `"250ms"` or
/// `"5s"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub name: String,
    pub failure_policy: FailurePolicy,
    /// Processing one event for longer than this is reported as a warning.
    #[serde(deserialize_with = "humantime_duration")]
    pub execution_timeout: Duration,
    /// Longest wait between pending-work checks while quiescing.
    #[serde(deserialize_with = "humantime_duration")]
    pub quiesce_poll_interval: Duration,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "fsm".to_string(),
            failure_policy: FailurePolicy::Continue,
            execution_timeout: Duration::from_secs(5),
            quiesce_poll_interval: Duration::from_millis(500),
        }
    }
}

impl MachineConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the execution timeout from a string such as `"2s"`.
    pub fn with_execution_timeout(mut self, value: &str) -> Result<Self, ConfigError> {
        self.execution_timeout = parse_duration(value)?;
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("machine name must not be empty".into()));
        }
        if self.execution_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "execution timeout must be greater than zero".into(),
            ));
        }
        if self.quiesce_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "quiesce poll interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Parses a human readable duration such as `"1m 30s"`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration {
        value: value.to_string(),
        source,
    })
}

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    parse_duration(&value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults_and_humantime_durations() {
        let config: MachineConfig = serde_json::from_str(
            r#"{ "name": "motor", "failure_policy": "stop", "execution_timeout": "250ms" }"#,
        )
        .unwrap();

        assert_eq!(config.name, "motor");
        assert_eq!(config.failure_policy, FailurePolicy::Stop);
        assert_eq!(config.execution_timeout, Duration::from_millis(250));
        assert_eq!(config.quiesce_poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn rejects_bad_durations() {
        let result = serde_json::from_str::<MachineConfig>(r#"{ "execution_timeout": "soon" }"#);
        assert!(result.is_err());

        let result = MachineConfig::named("light").with_execution_timeout("forever");
        assert!(matches!(result, Err(ConfigError::InvalidDuration { .. })));
    }

    #[test]
    fn validation_catches_empty_names() {
        assert!(MachineConfig::named(" ").validate().is_err());
        assert!(MachineConfig::named("light").validate().is_ok());
    }

    #[test]
    fn validation_rejects_zero_durations() {
        let config = MachineConfig::named("light").with_execution_timeout("0s").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = MachineConfig {
            quiesce_poll_interval: Duration::ZERO,
            ..MachineConfig::named("light")
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
