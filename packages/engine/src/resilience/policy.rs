// packages/engine/src/resilience/policy.rs
//! Retry policy value object
//!
//! A policy is plain data: attempt budget, backoff parameters, error
//! classification and optional circuit-breaker/timeout settings. Behaviour
//! lives in [`crate::resilience::engine::RetryEngine`].

use crate::resilience::backoff::BackoffStrategy;
use crate::resilience::classify::{Classification, Classify, ErrorMatcher};
use crate::resilience::presets::PolicyPreset;
use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Name used in logs, metrics and for the policy's own breaker
    pub name: String,

    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,

    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    pub backoff_multiplier: f64,

    /// Jitter share in `[0, 1)` for `ExponentialJitter`
    pub jitter_range: f64,

    /// Overall budget across all attempts and backoff sleeps
    pub timeout: Option<Duration>,

    pub retryable_errors: Vec<ErrorMatcher>,

    /// Checked before `retryable_errors`
    pub non_retryable_errors: Vec<ErrorMatcher>,

    pub circuit_breaker_enabled: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter_range: 0.1,
            timeout: None,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
            circuit_breaker_enabled: false,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn builder(name: impl Into<String>) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(name)
    }

    /// Classify an error for this policy
    ///
    /// Non-retryable matchers win. With an empty retryable list every other
    /// error is retried; otherwise only listed errors are.
    pub fn classify<E>(&self, error: &E) -> Classification
    where
        E: Classify + fmt::Display,
    {
        if self.non_retryable_errors.iter().any(|m| m.matches(error)) {
            return Classification::NonRetryable;
        }

        if self.retryable_errors.is_empty() || self.retryable_errors.iter().any(|m| m.matches(error)) {
            Classification::Retryable
        } else {
            Classification::NonRetryable
        }
    }

    /// Validate policy values
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::ConfigError(format!(
                "policy '{}': max_attempts must be at least 1",
                self.name
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_range) {
            return Err(EngineError::ConfigError(format!(
                "policy '{}': jitter_range must be in [0, 1), got {}",
                self.name, self.jitter_range
            )));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0) {
            return Err(EngineError::ConfigError(format!(
                "policy '{}': backoff_multiplier must be positive",
                self.name
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(EngineError::ConfigError(format!(
                "policy '{}': base_delay {:?} exceeds max_delay {:?}",
                self.name, self.base_delay, self.max_delay
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(EngineError::ConfigError(format!(
                "policy '{}': timeout must be greater than zero",
                self.name
            )));
        }
        if self.circuit_breaker_enabled && self.breaker_failure_threshold == 0 {
            return Err(EngineError::ConfigError(format!(
                "policy '{}': breaker_failure_threshold must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Fluent builder for [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            policy: RetryPolicy {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.strategy = strategy;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, range: f64) -> Self {
        self.policy.jitter_range = range;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn retry_on(mut self, matcher: impl Into<ErrorMatcher>) -> Self {
        self.policy.retryable_errors.push(matcher.into());
        self
    }

    pub fn never_retry_on(mut self, matcher: impl Into<ErrorMatcher>) -> Self {
        self.policy.non_retryable_errors.push(matcher.into());
        self
    }

    pub fn circuit_breaker(mut self, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        self.policy.circuit_breaker_enabled = true;
        self.policy.breaker_failure_threshold = failure_threshold;
        self.policy.breaker_recovery_timeout = recovery_timeout;
        self
    }

    pub fn build(self) -> Result<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Externally supplied overrides for attempt count and delays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl RetryOverrides {
    /// Read `<PREFIX>_RETRY_*` (falling back to `RETRY_*`) from the process
    /// environment
    pub fn from_env(prefix: Option<&str>) -> Self {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Same as [`RetryOverrides::from_env`] with an injectable variable lookup
    pub fn from_lookup<F>(prefix: Option<&str>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| -> Option<u64> {
            let keys = prefix
                .map(|p| format!("{}_RETRY_{}", p.to_uppercase(), suffix))
                .into_iter()
                .chain(std::iter::once(format!("RETRY_{}", suffix)));

            for key in keys {
                if let Some(raw) = lookup(&key) {
                    match raw.trim().parse::<u64>() {
                        Ok(value) => return Some(value),
                        Err(e) => warn!("Ignoring invalid {}={:?}: {}", key, raw, e),
                    }
                }
            }
            None
        };

        Self {
            max_attempts: read("MAX_ATTEMPTS").and_then(|v| u32::try_from(v).ok()),
            base_delay: read("BASE_DELAY_MS").map(Duration::from_millis),
            max_delay: read("MAX_DELAY_MS").map(Duration::from_millis),
            timeout: read("TIMEOUT_MS").map(Duration::from_millis),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fill unset fields from `fallback`
    pub fn or(self, fallback: RetryOverrides) -> Self {
        Self {
            max_attempts: self.max_attempts.or(fallback.max_attempts),
            base_delay: self.base_delay.or(fallback.base_delay),
            max_delay: self.max_delay.or(fallback.max_delay),
            timeout: self.timeout.or(fallback.timeout),
        }
    }

    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(attempts) = self.max_attempts {
            policy.max_attempts = attempts;
        }
        if let Some(base) = self.base_delay {
            policy.base_delay = base;
        }
        if let Some(max) = self.max_delay {
            policy.max_delay = max;
        }
        if let Some(timeout) = self.timeout {
            policy.timeout = Some(timeout);
        }
        policy
    }
}

/// Where a retry engine gets its policy from
#[derive(Debug, Clone)]
pub enum PolicySource {
    /// Built-in domain preset by name (`"database"`, `"llm"`, ...)
    Preset(String),
    Explicit(RetryPolicy),
}

impl PolicySource {
    /// Resolve to a validated policy; overrides only apply to presets
    pub fn resolve(self, overrides: &RetryOverrides) -> Result<RetryPolicy> {
        let policy = match self {
            PolicySource::Preset(name) => {
                let preset: PolicyPreset = name.parse()?;
                overrides.apply(preset.policy())
            }
            PolicySource::Explicit(policy) => policy,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Env prefix for preset sources, e.g. `DATABASE`
    pub fn env_prefix(&self) -> Option<String> {
        match self {
            PolicySource::Preset(name) => name
                .parse::<PolicyPreset>()
                .ok()
                .map(|preset| preset.env_prefix().to_string()),
            PolicySource::Explicit(_) => None,
        }
    }
}

impl From<RetryPolicy> for PolicySource {
    fn from(policy: RetryPolicy) -> Self {
        PolicySource::Explicit(policy)
    }
}

impl From<&str> for PolicySource {
    fn from(name: &str) -> Self {
        PolicySource::Preset(name.to_string())
    }
}
