//! Observability setup shared by Stratus binaries.

use serde::{Deserialize, Serialize};
use std::env;

pub mod logging;

pub use logging::{init_logging, LogExt};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit JSON to stdout instead of human-readable output
    pub enable_json_logging: bool,
    /// Also write JSON logs to this file, rotated daily
    pub log_file: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "stratus".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            log_file: None,
        }
    }
}

impl MonitoringConfig {
    /// Config for `service_name` with other fields at their defaults
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Apply `STRATUS_LOG_FILTER`, `STRATUS_LOG_JSON` and `STRATUS_LOG_FILE`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = env::var("STRATUS_LOG_FILTER") {
            self.log_filter = filter;
        }
        if let Ok(json) = env::var("STRATUS_LOG_JSON") {
            self.enable_json_logging = matches!(json.as_str(), "1" | "true" | "yes");
        }
        if let Ok(file) = env::var("STRATUS_LOG_FILE") {
            self.log_file = Some(file);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_service_keeps_defaults() {
        let config = MonitoringConfig::for_service("stratus-deploy");
        assert_eq!(config.service_name, "stratus-deploy");
        assert_eq!(config.log_filter, "info");
        assert!(!config.enable_json_logging);
        assert!(config.log_file.is_none());
    }
}
