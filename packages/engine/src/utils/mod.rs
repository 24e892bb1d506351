// packages/engine/src/utils/mod.rs
//! Shared utilities: error types and configuration

pub mod config;
pub mod errors;

pub use config::{EngineConfig, FactorySettings, ObservabilityConfig, RetrySettings};
pub use errors::{EngineError, Result};
