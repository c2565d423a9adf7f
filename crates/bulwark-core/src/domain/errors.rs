//! Errors raised by the underlying task call (the slow external service).
//!
//! The engine never inspects messages; it only looks at `ErrorKind` to decide
//! whether another attempt makes sense.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed call.
///
/// - Transient: timeouts, rate limits, 5xx. Worth retrying.
/// - Infrastructure: the service (or the path to it) is down. Retried; this
///   is what eventually trips a breaker.
/// - Validation / Authentication: the request itself is wrong. Retrying
///   cannot help.
/// - Cancelled: the call observed its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Infrastructure,
    Validation,
    Authentication,
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Infrastructure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Infrastructure => "infrastructure",
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error returned by a `TaskCall` or a `CacheLoader`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct TaskError {
    kind: ErrorKind,
    message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Infrastructure, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
