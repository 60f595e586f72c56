//! Retry policy and retry statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff policy supplied per call site.
///
/// Deserializes from human-readable durations:
/// ```toml
/// max_retries = 3
/// backoff_multiplier = 2.0
/// initial_delay = "500ms"
/// max_delay = "30s"
/// timeout = "2m"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total calls = `max_retries + 1`).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Per-attempt timeout. An attempt that exceeds it is abandoned.
    #[serde(default = "default_timeout", with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(120))
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            timeout: default_timeout(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, backoff_multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_retries,
            backoff_multiplier,
            initial_delay,
            max_delay,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Upper bound on calls made under this policy.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Statistics attached to an error once retries are exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    pub operation_name: String,
    /// Calls made, including the first.
    pub attempts: u32,
    pub total_delay_ms: u64,
    /// Jittered delay slept before each retry, in order.
    pub delays_ms: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn deserializes_humantime_durations() {
        let toml_str = r#"
max_retries = 2
backoff_multiplier = 3.0
initial_delay = "100ms"
max_delay = "1s"
timeout = "5s"
"#;
        let policy: RetryPolicy = toml::from_str(toml_str).unwrap();
        assert_eq!(policy.max_retries, 2);
        assert!((policy.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert_eq!(policy.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let policy: RetryPolicy = toml::from_str("max_retries = 1").unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.timeout, Some(Duration::from_secs(120)));
    }
}
