// packages/engine/src/resilience/circuit_breaker.rs
//! Circuit breaker
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                 │ recovery_timeout elapsed
//!     │ trial ok                        ▼
//!     └──────────────────────────── HalfOpen ──trial failed──▶ Open
//! ```
//!
//! `HalfOpen` admits a single trial call; further calls are rejected until
//! the trial reports back or is released.

use crate::observability::names;
use crate::resilience::classify::ErrorKind;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Narrow interface the retry engine consumes
pub trait CircuitBreaker: Send + Sync {
    /// Resource this breaker protects
    fn name(&self) -> &str;

    fn can_execute(&self) -> bool;

    /// Like [`CircuitBreaker::can_execute`], but tells the caller whether it
    /// holds the half-open trial slot
    fn admit(&self) -> Admission {
        if self.can_execute() {
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    /// Hand back a trial slot whose call ended without an outcome
    /// (cancelled or dropped)
    fn release_trial(&self) {}

    fn record_success(&self);

    fn record_failure(&self, kind: ErrorKind);

    fn status(&self) -> BreakerStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Rejected,
    Admitted,
    /// Admitted as the single half-open trial call
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Serializable breaker snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_kind: Option<ErrorKind>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_failure_kind: Option<ErrorKind>,
}

/// Threshold/recovery-timeout breaker
#[derive(Debug)]
pub struct DefaultCircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl DefaultCircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
                last_failure_kind: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Force the breaker back to `Closed`
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(
                "Circuit breaker '{}' opened after {} failures",
                self.name, inner.failure_count
            ),
            CircuitState::HalfOpen => debug!("Circuit breaker '{}' half-open, admitting trial call", self.name),
            CircuitState::Closed => info!("Circuit breaker '{}' closed", self.name),
        }
        inner.state = to;
        metrics::counter!(
            names::BREAKER_TRANSITIONS,
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

impl CircuitBreaker for DefaultCircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_execute(&self) -> bool {
        self.admit() != Admission::Rejected
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            debug!("Circuit breaker '{}' trial call abandoned, slot released", self.name);
            inner.trial_in_flight = false;
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn record_failure(&self, kind: ErrorKind) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_kind = Some(kind);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_kind: inner.last_failure_kind,
        }
    }
}

/// Breakers shared by resource name
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<DefaultCircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing breaker for `name`, or a new one with the given settings
    pub fn get_or_create(
        &self,
        name: &str,
        failure_threshold: u32,
        recovery_timeout: Duration,
    ) -> Arc<DefaultCircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Registering circuit breaker '{}'", name);
                Arc::new(DefaultCircuitBreaker::new(name, failure_threshold, recovery_timeout))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<DefaultCircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> =
            self.breakers.iter().map(|entry| entry.value().status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
