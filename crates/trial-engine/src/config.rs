//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the reconciliation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Apply attempts per patch operation
    pub patch_attempts: u32,
    /// Capture attempts per metric value
    pub metric_attempts: u32,
    /// Delay before re-checking a converging target
    pub stability_poll_secs: u64,
    /// Delay for generic "try again soon" requeues
    pub generic_retry_secs: u64,
    /// Delay while a metrics backend catches up with the trial
    pub metrics_retry_secs: u64,
    /// Time a setup job may take to start before it counts as failed
    pub setup_start_timeout_secs: u64,
    /// Run time of the default trial workload
    pub default_runtime_secs: u64,
    /// Image for setup tasks without one
    pub setup_image: String,
    /// Pull policy of `setup_image`
    pub setup_image_pull_policy: String,
    /// Timeout of metric HTTP requests
    pub http_timeout_secs: u64,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With patch attempts
    #[inline]
    #[must_use]
    pub fn with_patch_attempts(mut self, attempts: u32) -> Self {
        self.patch_attempts = attempts;
        self
    }

    /// With metric attempts
    #[inline]
    #[must_use]
    pub fn with_metric_attempts(mut self, attempts: u32) -> Self {
        self.metric_attempts = attempts;
        self
    }

    /// With setup image and pull policy
    #[inline]
    #[must_use]
    pub fn with_setup_image(mut self, image: impl Into<String>, pull_policy: impl Into<String>) -> Self {
        self.setup_image = image.into();
        self.setup_image_pull_policy = pull_policy.into();
        self
    }

    /// With setup start timeout
    #[inline]
    #[must_use]
    pub fn with_setup_start_timeout(mut self, timeout: Duration) -> Self {
        self.setup_start_timeout_secs = timeout.as_secs();
        self
    }

    /// Stability poll interval
    #[must_use]
    pub fn stability_poll(&self) -> Duration {
        Duration::from_secs(self.stability_poll_secs)
    }

    /// Generic retry interval
    #[must_use]
    pub fn generic_retry(&self) -> Duration {
        Duration::from_secs(self.generic_retry_secs)
    }

    /// Metrics backend retry interval
    #[must_use]
    pub fn metrics_retry(&self) -> Duration {
        Duration::from_secs(self.metrics_retry_secs)
    }

    /// Setup job start timeout
    #[must_use]
    pub fn setup_start_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_start_timeout_secs)
    }

    /// Metric HTTP timeout
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            patch_attempts: 3,
            metric_attempts: 3,
            stability_poll_secs: 5,
            generic_retry_secs: 1,
            metrics_retry_secs: 5,
            setup_start_timeout_secs: 120,
            default_runtime_secs: 120,
            setup_image: "ghcr.io/trialrunner/setuptools:latest".to_owned(),
            setup_image_pull_policy: "IfNotPresent".to_owned(),
            http_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"patch_attempts": 5}"#).unwrap();
        assert_eq!(config.patch_attempts, 5);
        assert_eq!(config.metric_attempts, 3);
        assert_eq!(config.stability_poll(), Duration::from_secs(5));
    }

    #[test]
    fn builders_apply() {
        let config = EngineConfig::new()
            .with_setup_image("setup:dev", "Never")
            .with_setup_start_timeout(Duration::from_secs(30));
        assert_eq!(config.setup_image, "setup:dev");
        assert_eq!(config.setup_start_timeout_secs, 30);
    }
}
