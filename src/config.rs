//! Runner configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the superstep scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum supersteps before the run fails.
    pub max_supersteps: usize,

    /// Maximum executors computing concurrently within one superstep.
    pub parallelism: usize,

    /// Optional wall-clock bound on a single superstep.
    #[serde(default, with = "humantime_serde")]
    pub superstep_timeout: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_supersteps: 100,
            parallelism: num_cpus::get(),
            superstep_timeout: None,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_supersteps(mut self, max: usize) -> Self {
        self.max_supersteps = max;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_superstep_timeout(mut self, timeout: Duration) -> Self {
        self.superstep_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_supersteps, 100);
        assert!(config.parallelism > 0);
        assert!(config.superstep_timeout.is_none());
    }

    #[test]
    fn test_builder() {
        let config = RunnerConfig::new()
            .with_max_supersteps(10)
            .with_parallelism(2)
            .with_superstep_timeout(Duration::from_secs(5));
        assert_eq!(config.max_supersteps, 10);
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.superstep_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parallelism_minimum() {
        let config = RunnerConfig::new().with_parallelism(0);
        assert_eq!(config.parallelism, 1);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = RunnerConfig::new()
            .with_max_supersteps(7)
            .with_superstep_timeout(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).unwrap();
        let restored: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.max_supersteps, 7);
        assert_eq!(
            restored.superstep_timeout,
            Some(Duration::from_millis(1500))
        );
    }
}
