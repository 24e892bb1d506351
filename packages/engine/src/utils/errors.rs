// packages/engine/src/utils/errors.rs
//! Error types for the tenant engine
//!
//! Every fallible library operation returns [`Result`]. Retry outcomes carry
//! the wrapped operation's own error instead (see
//! [`crate::resilience::RetryError`]), so this enum only describes failures
//! raised by the engine itself.

use crate::resilience::ShortCircuit;
use thiserror::Error;

/// Errors raised by the factory, the retry engine and configuration loading
#[derive(Debug, Error)]
pub enum EngineError {
    /// Tenant context failed validation (empty tenant id, missing run id, ...)
    #[error("invalid tenant context: {0}")]
    InvalidContext(String),

    /// Per-tenant admission control rejected the request
    #[error("tenant '{tenant_id}' reached its limit of {limit} concurrent engines")]
    TenantLimitExceeded { tenant_id: String, limit: usize },

    /// The injected unit builder failed
    #[error("failed to build execution unit: {0}")]
    UnitBuildFailed(String),

    /// A unit's dispose hook failed or overran its budget
    #[error("failed to dispose unit {key}: {reason}")]
    DisposalFailed { key: String, reason: String },

    /// The factory no longer accepts work
    #[error("engine factory is shutting down")]
    ShuttingDown,

    /// Invalid configuration or policy
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Circuit breaker rejected the call, no attempt was made
    #[error("circuit breaker '{resource}' is open")]
    CircuitOpen { resource: String },

    /// Overall retry budget exhausted
    #[error("overall retry budget of {budget_ms}ms exceeded")]
    OverallTimeoutExceeded { budget_ms: u64 },

    /// Operation cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Generic runtime failure
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl From<ShortCircuit> for EngineError {
    fn from(value: ShortCircuit) -> Self {
        match value {
            ShortCircuit::CircuitOpen { resource } => EngineError::CircuitOpen { resource },
            ShortCircuit::OverallTimeoutExceeded { budget } => EngineError::OverallTimeoutExceeded {
                budget_ms: budget.as_millis() as u64,
            },
            ShortCircuit::Cancelled => EngineError::Cancelled,
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(value: config::ConfigError) -> Self {
        EngineError::ConfigError(value.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tenant_limit_message() {
        let err = EngineError::TenantLimitExceeded {
            tenant_id: "u1".to_string(),
            limit: 2,
        };
        let message = err.to_string();
        assert!(message.contains("u1"));
        assert!(message.contains('2'));
    }

    #[test]
    fn test_from_short_circuit() {
        let err: EngineError = ShortCircuit::OverallTimeoutExceeded {
            budget: Duration::from_millis(1500),
        }
        .into();
        assert!(matches!(
            err,
            EngineError::OverallTimeoutExceeded { budget_ms: 1500 }
        ));

        let err: EngineError = ShortCircuit::CircuitOpen {
            resource: "db".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "circuit breaker 'db' is open");
    }
}
