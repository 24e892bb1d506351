// packages/engine/src/resilience/mod.rs
//! Unified retry / circuit-breaker engine
//!
//! - **Policy**: attempt budget, backoff, classification, breaker and timeout
//!   settings (plain data)
//! - **Presets**: database, LLM, agent, API, WebSocket and filesystem policies
//! - **Backoff**: fixed, linear, exponential (± jitter), Fibonacci, adaptive,
//!   custom
//! - **Circuit Breaker**: per-resource failure tracking
//! - **Engine**: async and blocking execution with per-attempt traces
//! - **Wrapper**: decorator form preserving the caller's error type
//!
//! # Flow
//!
//! ```text
//! execute(op)
//!   ├─ breaker.admit()?  ─── no ──▶ CircuitOpen (0 attempts)
//!   └─ attempt n
//!        ├─ budget left? ── no ──▶ OverallTimeoutExceeded
//!        ├─ op() within remaining budget
//!        │    ├─ Ok  ──▶ record_success ──▶ Success
//!        │    └─ Err ──▶ non-retryable / exhausted ──▶ record_failure ──▶ Operation(err)
//!        └─ sleep(backoff(n)) ──▶ attempt n+1
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod engine;
pub mod policy;
pub mod presets;
pub mod wrapper;

pub use backoff::{BackoffStrategy, CustomBackoff};
pub use circuit_breaker::{
    Admission, BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitState,
    DefaultCircuitBreaker,
};
pub use classify::{Classification, Classify, ErrorKind, ErrorMatcher};
pub use engine::{AttemptRecord, RetryEngine, RetryError, RetryResult, ShortCircuit};
pub use policy::{PolicySource, RetryOverrides, RetryPolicy, RetryPolicyBuilder};
pub use presets::PolicyPreset;
pub use wrapper::Retrying;
