// packages/engine/src/runtime/mod.rs
//! Multi-tenant execution runtime
//!
//! This module provides the execution-unit lifecycle, including:
//!
//! - **Factory**: per-tenant creation, cleanup and shutdown
//! - **Resource Limiter**: per-tenant concurrency caps
//! - **Registry**: exactly-once disposal bookkeeping and counters
//! - **Reaper**: periodic eviction of inactive and expired units
//! - **Notifier**: lifecycle/progress events scoped to a tenant run
//! - **Task Unit**: stock unit backed by a tokio task
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               ExecutionEngineFactory                    │
//! │                                                         │
//! │   TenantContext ──► TenantResourceLimiter ──► Builder   │
//! │                              │                  │       │
//! │                              ▼                  ▼       │
//! │                     UnitRegistry ◄──── EngineHandle     │
//! │                       ▲       ▲                         │
//! │          cleanup ─────┘       └───── Reaper (interval)  │
//! │                                                         │
//! │   Notifier ◄── UnitEmitter (tenant_id, run_id)          │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod factory;
pub mod notifier;
pub mod reaper;
pub mod registry;
pub mod resource_limiter;
pub mod task_unit;
pub mod tenant;
pub mod unit;

// Re-export commonly used types
pub use factory::{ExecutionEngineFactory, FactoryConfig};
pub use notifier::{
    ChannelNotifier, NoopNotifier, Notifier, NotifierEvent, Payload, TracingNotifier, UnitEmitter,
};
pub use reaper::ReapSummary;
pub use registry::{EvictionReason, FactoryMetrics, MetricsSnapshot};
pub use resource_limiter::{TenantLimits, TenantResourceLimiter};
pub use task_unit::{TaskContext, TaskUnit, TaskUnitBuilder, TaskUnitConfig};
pub use tenant::TenantContext;
pub use unit::{EngineHandle, ExecutionUnit, UnitBuilder, UnitKey};
