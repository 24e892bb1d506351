// packages/engine/src/lib.rs
//! Tenant Engine Library
//!
//! Multi-tenant lifecycle management for long-lived execution units, plus a
//! policy-driven retry engine for the fallible calls those units make.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: Execution engine factory, tenant limits, registry, reaper
//! - **resilience**: Retry policies, backoff, circuit breakers, presets
//! - **observability**: Tracing and Prometheus metrics setup
//! - **utils**: Configuration and error types

// Public module exports
pub mod observability;
pub mod resilience;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use resilience::{PolicyPreset, RetryEngine, RetryError, RetryPolicy, RetryResult};
pub use runtime::{
    EngineHandle, ExecutionEngineFactory, ExecutionUnit, FactoryConfig, TenantContext, UnitBuilder,
};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
