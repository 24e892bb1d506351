// packages/engine/src/resilience/wrapper.rs
//! Decorator form of the retry engine
//!
//! Wrapping keeps the operation's calling convention and error type: callers
//! get `Result<T, E>` back, with the operation's last error unchanged on
//! exhaustion. Breaker-open, budget and cancellation outcomes are converted
//! through `E: From<ShortCircuit>`.

use crate::resilience::classify::Classify;
use crate::resilience::engine::{RetryEngine, RetryResult, ShortCircuit};
use std::fmt;
use std::future::Future;

/// An operation bound to a retry engine
#[derive(Debug, Clone)]
pub struct Retrying<F> {
    engine: RetryEngine,
    op: F,
}

impl RetryEngine {
    /// Wrap a single-argument operation; use `()` for operations without
    /// arguments
    pub fn wrap<F>(&self, op: F) -> Retrying<F> {
        Retrying {
            engine: self.clone(),
            op,
        }
    }
}

impl<F> Retrying<F> {
    pub fn engine(&self) -> &RetryEngine {
        &self.engine
    }

    /// Call the wrapped async operation with retries
    pub async fn call<A, T, E, Fut>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        A: Clone,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display + From<ShortCircuit>,
    {
        self.call_traced(arg).await.into_result().map_err(|e| e.into_original())
    }

    /// Like [`Retrying::call`] but keeps the attempt trace
    pub async fn call_traced<A, T, E, Fut>(&self, arg: A) -> RetryResult<T, E>
    where
        F: Fn(A) -> Fut,
        A: Clone,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.engine.execute(|| (self.op)(arg.clone())).await
    }

    /// Call the wrapped synchronous operation with retries
    pub fn call_blocking<A, T, E>(&self, arg: A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        A: Clone,
        E: Classify + fmt::Display + From<ShortCircuit>,
    {
        self.engine
            .execute_blocking(|| (self.op)(arg.clone()))
            .into_result()
            .map_err(|e| e.into_original())
    }
}
