// packages/engine/src/runtime/tenant.rs
//! Tenant context passed to `create_for_user`

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ulid::Ulid;

/// Identifies who a unit runs for and which run it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantContext {
    /// Required, non-empty
    pub tenant_id: String,

    /// Unique per creation request
    pub run_id: String,

    /// Opaque data forwarded to the unit builder
    #[serde(default)]
    pub auxiliary: HashMap<String, serde_json::Value>,
}

impl TenantContext {
    /// Context with a freshly generated ULID run id
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            run_id: Ulid::new().to_string(),
            auxiliary: HashMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_aux(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.auxiliary.insert(key.into(), value);
        self
    }

    /// Reject contexts the factory must never silently coerce
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(EngineError::InvalidContext(
                "tenant id must not be empty".to_string(),
            ));
        }
        if self.run_id.trim().is_empty() {
            return Err(EngineError::InvalidContext(format!(
                "run id must not be empty (tenant '{}')",
                self.tenant_id
            )));
        }
        Ok(())
    }
}
