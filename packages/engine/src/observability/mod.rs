// packages/engine/src/observability/mod.rs
//! Tracing and metrics initialization
//!
//! The library itself only emits through the `tracing` and `metrics`
//! facades; installing subscribers and recorders is left to the binary.

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Metric names emitted by the engine
pub mod names {
    pub const UNITS_CREATED: &str = "tenant_engine_units_created_total";
    pub const UNITS_CLEANED: &str = "tenant_engine_units_cleaned_total";
    pub const CREATION_ERRORS: &str = "tenant_engine_creation_errors_total";
    pub const TENANT_LIMIT_REJECTIONS: &str = "tenant_engine_tenant_limit_rejections_total";
    pub const TIMEOUT_EVICTIONS: &str = "tenant_engine_timeout_evictions_total";
    pub const DISPOSAL_ERRORS: &str = "tenant_engine_disposal_errors_total";
    pub const ACTIVE_UNITS: &str = "tenant_engine_active_units";

    pub const RETRY_ATTEMPTS: &str = "retry_attempts_total";
    pub const RETRY_SUCCESS: &str = "retry_success_total";
    pub const RETRY_FAILURES: &str = "retry_failures_total";
    pub const BREAKER_TRANSITIONS: &str = "circuit_breaker_transitions_total";
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| EngineError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| EngineError::RuntimeError(format!("Failed to install tracing: {}", e)))
}

/// Install the Prometheus recorder if a listen address is configured
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        info!("Metrics export disabled (no metrics_addr configured)");
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::ConfigError(format!("Invalid metrics address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::RuntimeError(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        let config = ObservabilityConfig::default();
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_invalid_metrics_address() {
        let config = ObservabilityConfig {
            metrics_addr: Some("not-an-address".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(EngineError::ConfigError(_))
        ));
    }
}
