// packages/engine/src/resilience/engine.rs
//! Retry engine
//!
//! Turns a raw operation into a resilient one:
//!
//! 1. Breaker rejects → `CircuitOpen`, zero attempts
//! 2. For each attempt: check the overall budget, run the operation bounded
//!    by what is left of it, classify failures
//! 3. Non-retryable or exhausted → `RecordFailure`, return the original error
//! 4. Otherwise sleep the backoff delay (clamped to the budget) and retry
//!
//! The async and blocking entry points are thin loops over the same
//! [`RetryRun`] bookkeeping, so both produce identical traces and decisions.

use crate::observability::names;
use crate::resilience::circuit_breaker::{
    Admission, BreakerRegistry, CircuitBreaker, DefaultCircuitBreaker,
};
use crate::resilience::classify::{Classification, Classify, ErrorKind};
use crate::resilience::policy::{PolicySource, RetryOverrides, RetryPolicy};
use crate::utils::config::RetrySettings;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Trace of a single attempt
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// 1-indexed
    pub attempt_number: u32,

    /// Backoff slept before this attempt (zero for the first)
    pub delay_before_attempt: Duration,

    /// Rendered error, `None` when the attempt succeeded
    pub error: Option<String>,

    pub error_kind: Option<ErrorKind>,

    /// Wall-clock start of the attempt
    pub timestamp: DateTime<Utc>,

    /// Time spent inside the operation
    pub elapsed: Duration,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a retried call ended without the operation's own error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortCircuit {
    #[error("circuit breaker '{resource}' is open")]
    CircuitOpen { resource: String },

    #[error("overall retry budget of {budget:?} exceeded")]
    OverallTimeoutExceeded { budget: Duration },

    #[error("retry cancelled")]
    Cancelled,
}

/// Final error of a failed [`RetryResult`]
#[derive(Debug, Error, PartialEq)]
pub enum RetryError<E> {
    /// Breaker rejected the call, no attempt was made
    #[error("circuit breaker '{resource}' is open")]
    CircuitOpen { resource: String },

    #[error("overall retry budget of {budget:?} exceeded")]
    OverallTimeoutExceeded { budget: Duration },

    #[error("retry cancelled")]
    Cancelled,

    /// The operation's own error, unchanged
    #[error("{0}")]
    Operation(E),
}

impl<E> RetryError<E> {
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            RetryError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn short_circuit(&self) -> Option<ShortCircuit> {
        match self {
            RetryError::CircuitOpen { resource } => Some(ShortCircuit::CircuitOpen {
                resource: resource.clone(),
            }),
            RetryError::OverallTimeoutExceeded { budget } => {
                Some(ShortCircuit::OverallTimeoutExceeded { budget: *budget })
            }
            RetryError::Cancelled => Some(ShortCircuit::Cancelled),
            RetryError::Operation(_) => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    /// Collapse into the caller's error type; operation errors pass through
    /// untouched
    pub fn into_original(self) -> E
    where
        E: From<ShortCircuit>,
    {
        match self {
            RetryError::Operation(e) => e,
            RetryError::CircuitOpen { resource } => E::from(ShortCircuit::CircuitOpen { resource }),
            RetryError::OverallTimeoutExceeded { budget } => {
                E::from(ShortCircuit::OverallTimeoutExceeded { budget })
            }
            RetryError::Cancelled => E::from(ShortCircuit::Cancelled),
        }
    }
}

/// Outcome of a retried operation plus its attempt trace
#[derive(Debug)]
pub struct RetryResult<T, E> {
    outcome: std::result::Result<T, RetryError<E>>,
    attempts: Vec<AttemptRecord>,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn final_error(&self) -> Option<&RetryError<E>> {
        self.outcome.as_ref().err()
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.len()
    }

    /// Operation time plus backoff sleeps across all attempts
    pub fn total_elapsed(&self) -> Duration {
        self.attempts
            .iter()
            .map(|a| a.delay_before_attempt + a.elapsed)
            .sum()
    }

    pub fn into_result(self) -> std::result::Result<T, RetryError<E>> {
        self.outcome
    }

    pub fn into_parts(self) -> (std::result::Result<T, RetryError<E>>, Vec<AttemptRecord>) {
        (self.outcome, self.attempts)
    }
}

enum Decision {
    RetryAfter(Duration),
    GiveUp,
}

enum AttemptOutcome<T, E> {
    Done(std::result::Result<T, E>),
    TimedOut,
    Cancelled,
}

/// Per-call bookkeeping shared by the async and blocking loops
///
/// Holding the breaker's half-open trial slot is tracked here; a run that
/// ends (or is dropped) without reporting an outcome hands the slot back.
struct RetryRun<'a> {
    policy: &'a RetryPolicy,
    breaker: Option<&'a dyn CircuitBreaker>,
    holds_trial: bool,
    started: Instant,
    pending_delay: Duration,
    attempts: Vec<AttemptRecord>,
}

impl Drop for RetryRun<'_> {
    fn drop(&mut self) {
        if !self.holds_trial {
            return;
        }
        if let Some(breaker) = self.breaker {
            breaker.release_trial();
        }
    }
}

impl<'a> RetryRun<'a> {
    fn new(policy: &'a RetryPolicy, breaker: Option<&'a dyn CircuitBreaker>) -> Self {
        Self {
            policy,
            breaker,
            holds_trial: false,
            started: Instant::now(),
            pending_delay: Duration::ZERO,
            attempts: Vec::with_capacity(policy.max_attempts as usize),
        }
    }

    fn circuit_open(&mut self) -> Option<String> {
        let breaker = self.breaker?;
        match breaker.admit() {
            Admission::Rejected => Some(breaker.name().to_string()),
            Admission::Admitted => None,
            Admission::Trial => {
                self.holds_trial = true;
                None
            }
        }
    }

    /// `None` when no overall timeout is configured
    fn remaining_budget(&self) -> Option<Duration> {
        self.policy
            .timeout
            .map(|budget| budget.saturating_sub(self.started.elapsed()))
    }

    fn budget_exhausted(&self) -> bool {
        self.remaining_budget().map_or(false, |left| left.is_zero())
    }

    fn push(&mut self, attempt: u32, started: Instant, at: DateTime<Utc>, error: Option<(String, ErrorKind)>) {
        let (error, error_kind) = match error {
            Some((message, kind)) => (Some(message), Some(kind)),
            None => (None, None),
        };
        self.attempts.push(AttemptRecord {
            attempt_number: attempt,
            delay_before_attempt: std::mem::take(&mut self.pending_delay),
            error,
            error_kind,
            timestamp: at,
            elapsed: started.elapsed(),
        });
    }

    fn record_error<E>(&mut self, attempt: u32, started: Instant, at: DateTime<Utc>, error: &E) -> Decision
    where
        E: Classify + fmt::Display,
    {
        let kind = error.error_kind();
        self.push(attempt, started, at, Some((error.to_string(), kind)));

        let classification = self.policy.classify(error);
        if classification == Classification::NonRetryable {
            debug!(
                "Policy '{}': attempt {} failed with non-retryable {} error: {}",
                self.policy.name, attempt, kind, error
            );
            return Decision::GiveUp;
        }
        if attempt >= self.policy.max_attempts {
            return Decision::GiveUp;
        }

        let mut delay = self.policy.delay_for(attempt);
        if let Some(left) = self.remaining_budget() {
            delay = delay.min(left);
        }
        self.pending_delay = delay;

        debug!(
            "Policy '{}': attempt {}/{} failed ({}), retrying in {:?}",
            self.policy.name, attempt, self.policy.max_attempts, error, delay
        );
        Decision::RetryAfter(delay)
    }

    fn succeed<T, E>(mut self, attempt: u32, started: Instant, at: DateTime<Utc>, value: T) -> RetryResult<T, E> {
        self.push(attempt, started, at, None);
        if let Some(breaker) = self.breaker {
            breaker.record_success();
        }
        self.holds_trial = false;
        metrics::counter!(names::RETRY_SUCCESS, "policy" => self.policy.name.clone()).increment(1);
        self.finish(Ok(value))
    }

    fn fail<T, E>(mut self, error: E) -> RetryResult<T, E>
    where
        E: Classify + fmt::Display,
    {
        warn!(
            "Policy '{}': giving up after {} attempt(s): {}",
            self.policy.name,
            self.attempts.len(),
            error
        );
        self.record_breaker_failure(error.error_kind());
        self.count_failure("operation");
        self.finish(Err(RetryError::Operation(error)))
    }

    fn budget_exceeded<T, E>(mut self) -> RetryResult<T, E> {
        let budget = self.policy.timeout.unwrap_or_default();
        warn!(
            "Policy '{}': overall budget of {:?} exceeded after {} attempt(s)",
            self.policy.name,
            budget,
            self.attempts.len()
        );
        self.record_breaker_failure(ErrorKind::Timeout);
        self.count_failure("timeout");
        self.finish(Err(RetryError::OverallTimeoutExceeded { budget }))
    }

    fn cancelled<T, E>(self) -> RetryResult<T, E> {
        debug!("Policy '{}': cancelled", self.policy.name);
        self.count_failure("cancelled");
        self.finish(Err(RetryError::Cancelled))
    }

    fn circuit_rejected<T, E>(self, resource: String) -> RetryResult<T, E> {
        debug!(
            "Policy '{}': circuit breaker '{}' open, skipping call",
            self.policy.name, resource
        );
        self.count_failure("circuit_open");
        self.finish(Err(RetryError::CircuitOpen { resource }))
    }

    fn record_breaker_failure(&mut self, kind: ErrorKind) {
        if let Some(breaker) = self.breaker {
            breaker.record_failure(kind);
        }
        self.holds_trial = false;
    }

    fn count_failure(&self, reason: &'static str) {
        metrics::counter!(
            names::RETRY_FAILURES,
            "policy" => self.policy.name.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    fn finish<T, E>(mut self, outcome: std::result::Result<T, RetryError<E>>) -> RetryResult<T, E> {
        metrics::counter!(names::RETRY_ATTEMPTS, "policy" => self.policy.name.clone())
            .increment(self.attempts.len() as u64);
        RetryResult {
            outcome,
            attempts: std::mem::take(&mut self.attempts),
        }
    }
}

/// Executes operations under a [`RetryPolicy`], optionally breaker-guarded
#[derive(Clone)]
pub struct RetryEngine {
    policy: Arc<RetryPolicy>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("policy", &self.policy.name)
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

impl RetryEngine {
    /// Engine with a private breaker when the policy enables one
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;

        let breaker = policy.circuit_breaker_enabled.then(|| {
            Arc::new(DefaultCircuitBreaker::new(
                policy.name.clone(),
                policy.breaker_failure_threshold,
                policy.breaker_recovery_timeout,
            )) as Arc<dyn CircuitBreaker>
        });

        Ok(Self {
            policy: Arc::new(policy),
            breaker,
        })
    }

    /// Engine whose breaker is shared through `registry` under the policy name
    pub fn with_registry(policy: RetryPolicy, registry: &BreakerRegistry) -> Result<Self> {
        policy.validate()?;

        let breaker = policy.circuit_breaker_enabled.then(|| {
            registry.get_or_create(
                &policy.name,
                policy.breaker_failure_threshold,
                policy.breaker_recovery_timeout,
            ) as Arc<dyn CircuitBreaker>
        });

        Ok(Self {
            policy: Arc::new(policy),
            breaker,
        })
    }

    /// Build from a preset name or explicit policy
    ///
    /// Environment overrides for presets are read here, once.
    pub fn from_source(source: impl Into<PolicySource>) -> Result<Self> {
        let source = source.into();
        let overrides = match source.env_prefix() {
            Some(prefix) => RetryOverrides::from_env(Some(&prefix)),
            None => RetryOverrides::default(),
        };
        Self::new(source.resolve(&overrides)?)
    }

    /// Build from the `retry` config section; environment overrides win
    pub fn from_settings(settings: &RetrySettings) -> Result<Self> {
        let source = PolicySource::Preset(settings.default_preset.clone());
        let env = match source.env_prefix() {
            Some(prefix) => RetryOverrides::from_env(Some(&prefix)),
            None => RetryOverrides::default(),
        };
        Self::new(source.resolve(&env.or(settings.overrides()))?)
    }

    /// Replace the breaker (e.g. with one owned by the caller)
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn without_breaker(mut self) -> Self {
        self.breaker = None;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> Option<&Arc<dyn CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Run `op` with retries, suspending cooperatively between attempts
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.run_async(op, None).await
    }

    /// Same as [`RetryEngine::execute`], aborting promptly once `cancel`
    /// fires (mid-attempt or mid-backoff)
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        op: F,
        cancel: &CancellationToken,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.run_async(op, Some(cancel)).await
    }

    async fn run_async<T, E, F, Fut>(
        &self,
        mut op: F,
        cancel: Option<&CancellationToken>,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut run = RetryRun::new(&self.policy, self.breaker.as_deref());

        // Cancelled before starting: leave the breaker untouched
        if cancel.map_or(false, |token| token.is_cancelled()) {
            return run.cancelled();
        }
        if let Some(resource) = run.circuit_open() {
            return run.circuit_rejected(resource);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            if cancel.map_or(false, |token| token.is_cancelled()) {
                return run.cancelled();
            }
            if run.budget_exhausted() {
                return run.budget_exceeded();
            }

            let started = Instant::now();
            let at = Utc::now();
            let outcome = bounded(op(), run.remaining_budget(), cancel).await;

            match outcome {
                AttemptOutcome::Done(Ok(value)) => return run.succeed(attempt, started, at, value),
                AttemptOutcome::Done(Err(error)) => {
                    match run.record_error(attempt, started, at, &error) {
                        Decision::GiveUp => return run.fail(error),
                        Decision::RetryAfter(delay) => {
                            if !sleep(delay, cancel).await {
                                return run.cancelled();
                            }
                        }
                    }
                }
                AttemptOutcome::TimedOut => {
                    run.push(
                        attempt,
                        started,
                        at,
                        Some(("attempt exceeded remaining retry budget".to_string(), ErrorKind::Timeout)),
                    );
                    return run.budget_exceeded();
                }
                AttemptOutcome::Cancelled => {
                    run.push(
                        attempt,
                        started,
                        at,
                        Some(("attempt cancelled".to_string(), ErrorKind::Cancelled)),
                    );
                    return run.cancelled();
                }
            }
        }
    }

    /// Blocking variant for synchronous call sites
    ///
    /// A running closure cannot be interrupted: the overall budget is checked
    /// before each attempt and backoff sleeps are clamped to what is left.
    pub fn execute_blocking<T, E, F>(&self, mut op: F) -> RetryResult<T, E>
    where
        F: FnMut() -> std::result::Result<T, E>,
        E: Classify + fmt::Display,
    {
        let mut run = RetryRun::new(&self.policy, self.breaker.as_deref());

        if let Some(resource) = run.circuit_open() {
            return run.circuit_rejected(resource);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            if run.budget_exhausted() {
                return run.budget_exceeded();
            }

            let started = Instant::now();
            let at = Utc::now();

            match op() {
                Ok(value) => return run.succeed(attempt, started, at, value),
                Err(error) => match run.record_error(attempt, started, at, &error) {
                    Decision::GiveUp => return run.fail(error),
                    Decision::RetryAfter(delay) => std::thread::sleep(delay),
                },
            }
        }
    }
}

/// Run one attempt bounded by the remaining budget and the cancel token
async fn bounded<T, E, Fut>(
    fut: Fut,
    budget: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> AttemptOutcome<T, E>
where
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let call = async {
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => AttemptOutcome::Cancelled,
                result = fut => AttemptOutcome::Done(result),
            },
            None => AttemptOutcome::Done(fut.await),
        }
    };

    match budget {
        Some(left) => tokio::time::timeout(left, call)
            .await
            .unwrap_or(AttemptOutcome::TimedOut),
        None => call.await,
    }
}

/// Backoff sleep; `false` when cancelled first
async fn sleep(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
