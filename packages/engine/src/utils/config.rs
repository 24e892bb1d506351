// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered loading through the `config` crate:
//!
//! 1. Built-in defaults
//! 2. Optional `config/engine.{toml,yaml,json}` file
//! 3. `TENANT_ENGINE__<SECTION>__<KEY>` environment variables

use crate::resilience::policy::RetryOverrides;
use crate::runtime::factory::FactoryConfig;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "TENANT_ENGINE";

/// Default configuration file (extension resolved by the `config` crate)
pub const DEFAULT_CONFIG_FILE: &str = "config/engine";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub factory: FactorySettings,
    pub retry: RetrySettings,
    pub observability: ObservabilityConfig,
}

/// Factory section (serializable, whole seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorySettings {
    /// Maximum live engines per tenant
    pub max_engines_per_tenant: usize,

    /// Unit TTL before the reaper evicts it
    pub timeout_secs: u64,

    /// Reaper tick interval
    pub cleanup_interval_secs: u64,

    /// How long shutdown waits for the reaper before aborting it
    pub shutdown_grace_secs: u64,

    /// Budget for a single unit's dispose hook
    pub dispose_timeout_secs: u64,

    /// Per-tenant caps replacing `max_engines_per_tenant`
    pub tenant_overrides: HashMap<String, usize>,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            max_engines_per_tenant: 3,
            timeout_secs: 1800,
            cleanup_interval_secs: 60,
            shutdown_grace_secs: 10,
            dispose_timeout_secs: 30,
            tenant_overrides: HashMap::new(),
        }
    }
}

impl FactorySettings {
    /// Convert into the runtime factory configuration
    pub fn to_factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            max_engines_per_tenant: self.max_engines_per_tenant,
            unit_timeout: Duration::from_secs(self.timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            dispose_timeout: Duration::from_secs(self.dispose_timeout_secs),
            tenant_overrides: self.tenant_overrides.clone(),
        }
    }
}

/// Retry section: default preset plus optional overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub default_preset: String,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            default_preset: "api".to_string(),
            max_attempts: None,
            base_delay_ms: None,
            max_delay_ms: None,
            timeout_ms: None,
        }
    }
}

impl RetrySettings {
    pub fn overrides(&self) -> RetryOverrides {
        RetryOverrides {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay_ms.map(Duration::from_millis),
            max_delay: self.max_delay_ms.map(Duration::from_millis),
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Logging and metrics export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Fallback filter when `RUST_LOG` is not set
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,

    /// Prometheus listen address; metrics export is disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        Self::build(config::File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EngineError::ConfigError(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        Self::build(config::File::from(path))
    }

    fn build<S>(file: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;

        debug!("Engine configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let factory = &self.factory;

        factory.to_factory_config().limits().validate()?;
        if factory.timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "factory.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if factory.cleanup_interval_secs == 0 {
            return Err(EngineError::ConfigError(
                "factory.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(EngineError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        self.retry
            .default_preset
            .parse::<crate::resilience::PolicyPreset>()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.factory.max_engines_per_tenant, 3);
        assert_eq!(config.retry.default_preset, "api");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[factory]
max_engines_per_tenant = 5
cleanup_interval_secs = 15

[retry]
default_preset = "database"
max_attempts = 7
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.factory.max_engines_per_tenant, 5);
        assert_eq!(config.factory.cleanup_interval_secs, 15);
        // Untouched fields keep their defaults
        assert_eq!(config.factory.timeout_secs, 1800);
        assert_eq!(config.retry.default_preset, "database");
        assert_eq!(config.retry.overrides().max_attempts, Some(7));
    }

    #[test]
    fn test_invalid_file_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[factory]\nmax_engines_per_tenant = 0").unwrap();

        let result = EngineConfig::load_from(file.path());
        assert!(matches!(result, Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let mut config = EngineConfig::default();
        config.retry.default_preset = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = EngineConfig::load_from("/definitely/not/here.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_factory_settings_conversion() {
        let settings = FactorySettings {
            max_engines_per_tenant: 2,
            timeout_secs: 10,
            cleanup_interval_secs: 5,
            shutdown_grace_secs: 1,
            dispose_timeout_secs: 3,
            tenant_overrides: HashMap::from([("vip".to_string(), 6)]),
        };
        let factory = settings.to_factory_config();
        assert_eq!(factory.max_engines_per_tenant, 2);
        assert_eq!(factory.unit_timeout, Duration::from_secs(10));
        assert_eq!(factory.cleanup_interval, Duration::from_secs(5));
        assert_eq!(factory.dispose_timeout, Duration::from_secs(3));
        assert_eq!(factory.limits().limit_for("vip"), 6);
        assert_eq!(factory.limits().limit_for("u1"), 2);
    }
}
