// packages/engine/src/resilience/classify.rs
//! Error classification for retry decisions
//!
//! Operations retried through the engine return errors implementing
//! [`Classify`]. Policies then match errors by kind or by message.

use crate::utils::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse error categories used by policies and circuit breakers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, reset or dropped
    Connection,
    Timeout,
    /// Address/DNS/transport level failures
    Network,
    RateLimit,
    /// 5xx-class upstream failures
    ServerError,
    /// 4xx-class request failures
    ClientError,
    Validation,
    /// Database constraint violations
    Constraint,
    /// Malformed queries or payloads
    Syntax,
    Authentication,
    NotFound,
    PermissionDenied,
    Io,
    Cancelled,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::Validation => "validation",
            ErrorKind::Constraint => "constraint",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can report their [`ErrorKind`]
pub trait Classify {
    fn error_kind(&self) -> ErrorKind;
}

impl Classify for std::io::Error {
    fn error_kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;

        match self.kind() {
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe => ErrorKind::Connection,
            Io::TimedOut => ErrorKind::Timeout,
            Io::AddrInUse | Io::AddrNotAvailable => ErrorKind::Network,
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::InvalidInput | Io::InvalidData => ErrorKind::Validation,
            _ => ErrorKind::Io,
        }
    }
}

impl Classify for tokio::time::error::Elapsed {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

impl Classify for EngineError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidContext(_) | EngineError::ConfigError(_) => ErrorKind::Validation,
            EngineError::TenantLimitExceeded { .. } => ErrorKind::RateLimit,
            EngineError::OverallTimeoutExceeded { .. } => ErrorKind::Timeout,
            EngineError::Cancelled | EngineError::ShuttingDown => ErrorKind::Cancelled,
            EngineError::CircuitOpen { .. } => ErrorKind::ServerError,
            EngineError::UnitBuildFailed(_)
            | EngineError::DisposalFailed { .. }
            | EngineError::RuntimeError(_) => ErrorKind::Other,
        }
    }
}

/// Matches an error by kind or by a case-insensitive message fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMatcher {
    Kind(ErrorKind),
    MessageContains(String),
}

impl ErrorMatcher {
    pub fn kind(kind: ErrorKind) -> Self {
        ErrorMatcher::Kind(kind)
    }

    pub fn message(fragment: impl Into<String>) -> Self {
        ErrorMatcher::MessageContains(fragment.into().to_lowercase())
    }

    pub fn matches<E>(&self, error: &E) -> bool
    where
        E: Classify + fmt::Display,
    {
        match self {
            ErrorMatcher::Kind(kind) => error.error_kind() == *kind,
            ErrorMatcher::MessageContains(fragment) => error
                .to_string()
                .to_lowercase()
                .contains(&fragment.to_lowercase()),
        }
    }
}

impl From<ErrorKind> for ErrorMatcher {
    fn from(kind: ErrorKind) -> Self {
        ErrorMatcher::Kind(kind)
    }
}

/// Outcome of classifying an error against a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    NonRetryable,
}
