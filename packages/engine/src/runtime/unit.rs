// packages/engine/src/runtime/unit.rs
//! Execution unit abstraction
//!
//! A unit is whatever the host runs for a tenant (a workflow engine, an
//! agent loop, a spawned task). The factory only needs to know whether it is
//! still active, when it was created and how to dispose of it.

use crate::runtime::notifier::UnitEmitter;
use crate::runtime::tenant::TenantContext;
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Long-lived, tenant-scoped unit of work
#[async_trait]
pub trait ExecutionUnit: Send + Sync + 'static {
    /// Inactive units are evicted on the next reaper pass
    fn is_active(&self) -> bool;

    /// Creation time; unit age is measured from here
    fn created_at(&self) -> DateTime<Utc>;

    /// Release everything the unit holds. Called at most once by the factory.
    async fn dispose(&self) -> Result<()>;
}

/// Host-supplied constructor for execution units
#[async_trait]
pub trait UnitBuilder: Send + Sync + 'static {
    type Unit: ExecutionUnit;

    async fn build(&self, ctx: &TenantContext, emitter: UnitEmitter) -> Result<Self::Unit>;
}

/// Registry key, `{tenant}:{run}:{creation micros}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey(String);

impl UnitKey {
    pub fn new(tenant_id: &str, run_id: &str, created_at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}:{}:{}",
            tenant_id,
            run_id,
            created_at.timestamp_micros()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-facing reference to a registered unit.
///
/// Bookkeeping fields are read-only; only the factory decides when the
/// unit goes away.
pub struct EngineHandle<U> {
    key: UnitKey,
    tenant_id: String,
    run_id: String,
    created_at: DateTime<Utc>,
    unit: Arc<U>,
}

impl<U> Clone for EngineHandle<U> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            tenant_id: self.tenant_id.clone(),
            run_id: self.run_id.clone(),
            created_at: self.created_at,
            unit: Arc::clone(&self.unit),
        }
    }
}

impl<U> fmt::Debug for EngineHandle<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("key", &self.key)
            .field("tenant_id", &self.tenant_id)
            .field("run_id", &self.run_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl<U> EngineHandle<U> {
    pub(crate) fn new(key: UnitKey, ctx: &TenantContext, created_at: DateTime<Utc>, unit: Arc<U>) -> Self {
        Self {
            key,
            tenant_id: ctx.tenant_id.clone(),
            run_id: ctx.run_id.clone(),
            created_at,
            unit,
        }
    }

    pub fn key(&self) -> &UnitKey {
        &self.key
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// When the factory registered the unit
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn unit(&self) -> &Arc<U> {
        &self.unit
    }
}
