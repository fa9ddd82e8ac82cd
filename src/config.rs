//! Configuration management for Bulwark.
//!
//! This module provides the [`Config`] struct that holds every tunable of
//! the resilience core. Configuration can be loaded from a YAML file or use
//! the built-in defaults; every field is optional.
//!
//! # Default Configuration Location
//!
//! The default configuration file is located at:
//! - Unix: `~/.config/bulwark/config.yaml`
//! - Windows: `%APPDATA%/bulwark/config.yaml`
//!
//! # Example Configuration File
//!
//! ```yaml
//! rate_limits:
//!   tiers:
//!     free:
//!       requests_per_minute: 30
//!       burst_size: 10
//!       refill_per_sec: 0.5
//!   ip:
//!     capacity: 60
//!     refill_per_sec: 1.0
//!   global:
//!     capacity: 10000
//!     refill_per_sec: 500
//!   workspace_multiplier: 10
//!   min_trust_factor: 0.5
//!
//! abuse:
//!   flood_violation_count: 3
//!   flood_window_secs: 60
//!
//! penalties:
//!   temp_block_minutes: 30
//!   max_auto_level: EXTENDED_BLOCK
//!
//! sweeper:
//!   interval_secs: 300
//!
//! services:
//!   - service_id: billing
//!     base_address: https://billing.internal:8443
//!     timeouts:
//!       request_timeout_ms: 5000
//!     retry:
//!       max_attempts: 3
//!       strategy: exponential
//!     circuit_breaker:
//!       failure_threshold: 5
//!       recovery_timeout_secs: 60
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use bulwark::Config;
//!
//! // Load from default location or use defaults
//! let config = Config::load()?;
//!
//! // Load from specific file
//! let config = Config::load_from_file(Path::new("./bulwark.yaml"))?;
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abuse::AbuseConfig;
use crate::connectivity::ServiceConfig;
use crate::penalty::PenaltyConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::sweeper::SweeperConfig;
use crate::{bail_if, Error, Result};

// =============================================================================
// CONFIG STRUCT
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub abuse: AbuseConfig,

    #[serde(default)]
    pub penalties: PenaltyConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Downstream services registered at startup.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

// =============================================================================
// CONFIG METHODS
// =============================================================================

impl Config {
    /// Loads configuration from the default config file or returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            debug!(path = %config_path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Loads and validates configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config_file_not_found_with_source(&display, e)
            } else {
                Error::Io(e)
            }
        })?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| Error::config_invalid_format(&display, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default configuration file path.
    ///
    /// Falls back to `./bulwark-config.yaml` when the platform config
    /// directory cannot be determined.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("bulwark").join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("./bulwark-config.yaml"))
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.rate_limits.validate()?;
        self.abuse.validate()?;
        self.penalties.validate()?;
        self.sweeper.validate()?;

        let mut seen = HashSet::new();
        for service in &self.services {
            service.validate()?;
            bail_if!(
                !seen.insert(service.service_id.as_str()),
                Error::config_invalid_value(
                    "services",
                    format!("duplicate service id '{}'", service.service_id),
                )
            );
        }
        Ok(())
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penalty::PenaltyLevel;
    use crate::retry::BackoffStrategy;
    use crate::tiers::SubscriptionTier;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.services.is_empty());
        assert_eq!(
            config.rate_limits.tiers.limits(SubscriptionTier::Free).burst_size,
            10
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
penalties:
  temp_block_minutes: 45
services:
  - service_id: billing
    base_address: https://billing.internal
    retry:
      strategy: linear
"#;

        let config: Config = serde_yaml::from_str(yaml).expect("Should deserialize");

        assert_eq!(config.penalties.temp_block_minutes, 45);
        assert_eq!(config.penalties.max_auto_level, PenaltyLevel::ExtendedBlock);
        assert_eq!(config.services[0].retry.strategy, BackoffStrategy::Linear);
        assert_eq!(config.services[0].circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut temp_file = NamedTempFile::new().expect("Should create temp file");
        let yaml = r#"
rate_limits:
  workspace_multiplier: 4
  ip:
    capacity: 20
    refill_per_sec: 0.5
"#;
        temp_file.write_all(yaml.as_bytes()).expect("Should write");

        let config = Config::load_from_file(temp_file.path()).expect("Should load");

        assert_eq!(config.rate_limits.workspace_multiplier, 4.0);
        assert_eq!(config.rate_limits.ip.capacity, 20.0);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let err = Config::load_from_file(&dir.path().join("absent.yaml")).unwrap_err();
        assert_eq!(err.code(), "B001");
    }

    #[test]
    fn test_malformed_yaml_is_reported() {
        let mut temp_file = NamedTempFile::new().expect("Should create temp file");
        temp_file
            .write_all(b"rate_limits: [unclosed")
            .expect("Should write");
        let err = Config::load_from_file(temp_file.path()).unwrap_err();
        assert_eq!(err.code(), "B002");
    }

    #[test]
    fn test_invalid_values_rejected_at_load() {
        let mut temp_file = NamedTempFile::new().expect("Should create temp file");
        let yaml = r#"
services:
  - service_id: billing
    base_address: https://billing.internal
    circuit_breaker:
      half_open_max_calls: 1
      success_threshold: 3
"#;
        temp_file.write_all(yaml.as_bytes()).expect("Should write");
        let err = Config::load_from_file(temp_file.path()).unwrap_err();
        assert_eq!(err.code(), "B003");
    }

    #[test]
    fn test_duplicate_services_rejected() {
        let config = Config {
            services: vec![
                ServiceConfig::new("billing", "https://a"),
                ServiceConfig::new("billing", "https://b"),
            ],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().expect("Should create temp dir");
        let config_path = temp_dir.path().join("nested").join("config.yaml");

        let original = Config {
            services: vec![ServiceConfig::new("search", "http://search:9200")
                .with_header("X-Client", "bulwark")],
            ..Config::default()
        };

        original.save(&config_path).expect("Should save");
        let loaded = Config::load_from_file(&config_path).expect("Should load");
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_config_path_returns_valid_path() {
        let path = Config::config_path();
        assert!(path.to_string_lossy().ends_with("config.yaml"));
        assert!(path.to_string_lossy().contains("bulwark"));
    }
}
