// packages/engine/src/runtime/resource_limiter.rs
//! Per-tenant admission control
//!
//! Caps how many live execution units one tenant may hold at a time. The
//! limiter is stateless; the factory counts live units under its registry
//! lock and asks the limiter whether one more is allowed.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Concurrency limits applied per tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantLimits {
    /// Live units allowed per tenant
    /// Example: 3 = a fourth concurrent create is rejected
    pub max_engines_per_tenant: usize,

    /// Tenant-specific caps that replace the default
    #[serde(default)]
    pub overrides: HashMap<String, usize>,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_engines_per_tenant: 3,
            overrides: HashMap::new(),
        }
    }
}

impl TenantLimits {
    pub fn new(max_engines_per_tenant: usize) -> Self {
        Self {
            max_engines_per_tenant,
            overrides: HashMap::new(),
        }
    }

    /// Give one tenant its own cap
    pub fn with_override(mut self, tenant_id: impl Into<String>, limit: usize) -> Self {
        self.overrides.insert(tenant_id.into(), limit);
        self
    }

    /// Cap that applies to `tenant_id`
    pub fn limit_for(&self, tenant_id: &str) -> usize {
        self.overrides
            .get(tenant_id)
            .copied()
            .unwrap_or(self.max_engines_per_tenant)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_engines_per_tenant == 0 {
            return Err(EngineError::ConfigError(
                "max_engines_per_tenant must be at least 1".to_string(),
            ));
        }
        if let Some((tenant, _)) = self.overrides.iter().find(|(_, limit)| **limit == 0) {
            return Err(EngineError::ConfigError(format!(
                "limit override for tenant '{}' must be at least 1",
                tenant
            )));
        }
        Ok(())
    }
}

/// Admission check for new units
#[derive(Debug, Clone, Default)]
pub struct TenantResourceLimiter {
    limits: TenantLimits,
}

impl TenantResourceLimiter {
    pub fn new(limits: TenantLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &TenantLimits {
        &self.limits
    }

    /// Allow one more unit when `live` is below the tenant's cap
    pub fn admit(&self, tenant_id: &str, live: usize) -> Result<()> {
        let limit = self.limits.limit_for(tenant_id);
        if live >= limit {
            return Err(EngineError::TenantLimitExceeded {
                tenant_id: tenant_id.to_string(),
                limit,
            });
        }
        Ok(())
    }

    /// Units still available to `tenant_id`
    pub fn headroom(&self, tenant_id: &str, live: usize) -> usize {
        self.limits.limit_for(tenant_id).saturating_sub(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = TenantLimits::default();
        assert_eq!(limits.max_engines_per_tenant, 3);
        assert_eq!(limits.limit_for("anyone"), 3);
    }

    #[test]
    fn test_admit_below_cap() {
        let limiter = TenantResourceLimiter::new(TenantLimits::new(2));
        assert!(limiter.admit("u1", 0).is_ok());
        assert!(limiter.admit("u1", 1).is_ok());
        assert_eq!(limiter.headroom("u1", 1), 1);
    }

    #[test]
    fn test_reject_at_cap() {
        let limiter = TenantResourceLimiter::new(TenantLimits::new(2));
        let err = limiter.admit("u1", 2).unwrap_err();
        match &err {
            EngineError::TenantLimitExceeded { tenant_id, limit } => {
                assert_eq!(tenant_id, "u1");
                assert_eq!(*limit, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("u1"));
        assert_eq!(limiter.headroom("u1", 5), 0);
    }

    #[test]
    fn test_override_applies_to_one_tenant() {
        let limiter =
            TenantResourceLimiter::new(TenantLimits::new(1).with_override("premium", 4));
        assert!(limiter.admit("premium", 3).is_ok());
        assert!(limiter.admit("basic", 1).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(TenantLimits::default().validate().is_ok());
        assert!(TenantLimits::new(0).validate().is_err());
        assert!(TenantLimits::new(2)
            .with_override("u1", 0)
            .validate()
            .is_err());
    }
}
