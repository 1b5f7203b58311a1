//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::env;
use stratus_core::CoreError;
use tracing::warn;

/// Configuration for [`SyncTaskScheduler`](crate::SyncTaskScheduler)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of task bodies executing at once, across all signatures
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Lowest accepted level
    #[serde(default)]
    pub min_level: i32,

    /// Highest accepted level
    #[serde(default = "default_max_level")]
    pub max_level: i32,

    /// Waiters allowed per signature before submissions are rejected
    #[serde(default)]
    pub max_pending_per_signature: Option<usize>,
}

fn default_max_workers() -> usize {
    16
}

fn default_max_level() -> i32 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_level: 0,
            max_level: default_max_level(),
            max_pending_per_signature: None,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `STRATUS_SCHED_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(workers) = parse_var::<usize>("STRATUS_SCHED_MAX_WORKERS") {
            config.max_workers = workers;
        }
        if let Some(level) = parse_var::<i32>("STRATUS_SCHED_MIN_LEVEL") {
            config.min_level = level;
        }
        if let Some(level) = parse_var::<i32>("STRATUS_SCHED_MAX_LEVEL") {
            config.max_level = level;
        }
        if let Some(pending) = parse_var::<usize>("STRATUS_SCHED_MAX_PENDING") {
            config.max_pending_per_signature = Some(pending);
        }

        config
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_workers == 0 {
            return Err(CoreError::ConfigurationError(
                "max_workers must be greater than zero".to_string(),
            ));
        }
        if self.min_level > self.max_level {
            return Err(CoreError::ConfigurationError(format!(
                "min_level {} is greater than max_level {}",
                self.min_level, self.max_level
            )));
        }
        Ok(())
    }

    /// Whether `level` lies in the accepted range
    pub fn accepts_level(&self, level: i32) -> bool {
        (self.min_level..=self.max_level).contains(&level)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Invalid {} value: {}", name, raw);
            None
        }
    }
}
