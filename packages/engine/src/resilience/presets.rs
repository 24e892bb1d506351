// packages/engine/src/resilience/presets.rs
//! Built-in domain retry policies

use crate::resilience::backoff::BackoffStrategy;
use crate::resilience::classify::{ErrorKind, ErrorMatcher};
use crate::resilience::policy::RetryPolicy;
use crate::utils::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Domain presets selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPreset {
    Database,
    Llm,
    Agent,
    Api,
    WebSocket,
    FileSystem,
}

impl PolicyPreset {
    pub const ALL: [PolicyPreset; 6] = [
        PolicyPreset::Database,
        PolicyPreset::Llm,
        PolicyPreset::Agent,
        PolicyPreset::Api,
        PolicyPreset::WebSocket,
        PolicyPreset::FileSystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPreset::Database => "database",
            PolicyPreset::Llm => "llm",
            PolicyPreset::Agent => "agent",
            PolicyPreset::Api => "api",
            PolicyPreset::WebSocket => "websocket",
            PolicyPreset::FileSystem => "filesystem",
        }
    }

    /// Prefix for `<PREFIX>_RETRY_*` environment overrides
    pub fn env_prefix(&self) -> &'static str {
        match self {
            PolicyPreset::Database => "DATABASE",
            PolicyPreset::Llm => "LLM",
            PolicyPreset::Agent => "AGENT",
            PolicyPreset::Api => "API",
            PolicyPreset::WebSocket => "WEBSOCKET",
            PolicyPreset::FileSystem => "FILESYSTEM",
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        match self {
            PolicyPreset::Database => database(),
            PolicyPreset::Llm => llm(),
            PolicyPreset::Agent => agent(),
            PolicyPreset::Api => api(),
            PolicyPreset::WebSocket => websocket(),
            PolicyPreset::FileSystem => filesystem(),
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyPreset {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "database" | "db" => Ok(PolicyPreset::Database),
            "llm" | "model" => Ok(PolicyPreset::Llm),
            "agent" => Ok(PolicyPreset::Agent),
            "api" | "http" => Ok(PolicyPreset::Api),
            "websocket" | "ws" => Ok(PolicyPreset::WebSocket),
            "filesystem" | "fs" | "file" => Ok(PolicyPreset::FileSystem),
            other => Err(EngineError::ConfigError(format!(
                "unknown retry preset '{}'",
                other
            ))),
        }
    }
}

fn kinds(kinds: &[ErrorKind]) -> Vec<ErrorMatcher> {
    kinds.iter().copied().map(ErrorMatcher::Kind).collect()
}

fn database() -> RetryPolicy {
    let mut retryable = kinds(&[
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::Network,
        ErrorKind::Io,
    ]);
    retryable.push(ErrorMatcher::message("deadlock"));
    retryable.push(ErrorMatcher::message("too many connections"));

    RetryPolicy {
        name: "database".to_string(),
        max_attempts: 5,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        strategy: BackoffStrategy::ExponentialJitter,
        backoff_multiplier: 2.0,
        jitter_range: 0.1,
        timeout: None,
        retryable_errors: retryable,
        non_retryable_errors: kinds(&[
            ErrorKind::Constraint,
            ErrorKind::Syntax,
            ErrorKind::Validation,
            ErrorKind::Authentication,
        ]),
        circuit_breaker_enabled: true,
        breaker_failure_threshold: 5,
        breaker_recovery_timeout: Duration::from_secs(30),
    }
}

fn llm() -> RetryPolicy {
    RetryPolicy {
        name: "llm".to_string(),
        max_attempts: 4,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(60),
        strategy: BackoffStrategy::ExponentialJitter,
        backoff_multiplier: 2.0,
        jitter_range: 0.2,
        timeout: Some(Duration::from_secs(300)),
        retryable_errors: kinds(&[
            ErrorKind::Timeout,
            ErrorKind::Connection,
            ErrorKind::Network,
            ErrorKind::RateLimit,
            ErrorKind::ServerError,
        ]),
        non_retryable_errors: kinds(&[
            ErrorKind::Validation,
            ErrorKind::Authentication,
            ErrorKind::ClientError,
        ]),
        circuit_breaker_enabled: true,
        breaker_failure_threshold: 3,
        breaker_recovery_timeout: Duration::from_secs(60),
    }
}

fn agent() -> RetryPolicy {
    // The calling agent owns its own breaker
    RetryPolicy {
        name: "agent".to_string(),
        max_attempts: 3,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(10),
        strategy: BackoffStrategy::Exponential,
        backoff_multiplier: 2.0,
        jitter_range: 0.0,
        timeout: None,
        retryable_errors: Vec::new(),
        non_retryable_errors: kinds(&[ErrorKind::Validation, ErrorKind::Cancelled]),
        circuit_breaker_enabled: false,
        breaker_failure_threshold: 5,
        breaker_recovery_timeout: Duration::from_secs(30),
    }
}

fn api() -> RetryPolicy {
    RetryPolicy {
        name: "api".to_string(),
        max_attempts: 4,
        base_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(15),
        strategy: BackoffStrategy::ExponentialJitter,
        backoff_multiplier: 2.0,
        jitter_range: 0.2,
        timeout: Some(Duration::from_secs(60)),
        retryable_errors: kinds(&[
            ErrorKind::Network,
            ErrorKind::Connection,
            ErrorKind::Timeout,
            ErrorKind::ServerError,
            ErrorKind::RateLimit,
        ]),
        non_retryable_errors: kinds(&[
            ErrorKind::ClientError,
            ErrorKind::Authentication,
            ErrorKind::Validation,
            ErrorKind::NotFound,
        ]),
        circuit_breaker_enabled: true,
        breaker_failure_threshold: 5,
        breaker_recovery_timeout: Duration::from_secs(30),
    }
}

fn websocket() -> RetryPolicy {
    RetryPolicy {
        name: "websocket".to_string(),
        max_attempts: 5,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(10),
        strategy: BackoffStrategy::Linear,
        backoff_multiplier: 1.0,
        jitter_range: 0.0,
        timeout: None,
        retryable_errors: kinds(&[
            ErrorKind::Connection,
            ErrorKind::Network,
            ErrorKind::Timeout,
        ]),
        non_retryable_errors: kinds(&[ErrorKind::Authentication, ErrorKind::Validation]),
        circuit_breaker_enabled: true,
        breaker_failure_threshold: 3,
        breaker_recovery_timeout: Duration::from_secs(15),
    }
}

fn filesystem() -> RetryPolicy {
    RetryPolicy {
        name: "filesystem".to_string(),
        max_attempts: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
        strategy: BackoffStrategy::Fixed,
        backoff_multiplier: 1.0,
        jitter_range: 0.0,
        timeout: None,
        retryable_errors: kinds(&[ErrorKind::Io, ErrorKind::Timeout]),
        non_retryable_errors: kinds(&[ErrorKind::NotFound, ErrorKind::PermissionDenied]),
        circuit_breaker_enabled: false,
        breaker_failure_threshold: 5,
        breaker_recovery_timeout: Duration::from_secs(30),
    }
}
