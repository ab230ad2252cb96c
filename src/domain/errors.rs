//! Domain error types
//!
//! Two error hierarchies live here:
//!
//! - [`TallyError`] for application-level failures (configuration, startup
//!   connectivity, I/O). These are the only errors allowed to stop the process.
//! - [`TaskError`] for failures while resolving a single task. Every task error
//!   is converted into an error result and published; none of them is fatal.
//!
//! Neither type exposes third-party error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main application error type
#[derive(Debug, Error)]
pub enum TallyError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Database connectivity or pool errors
    #[error("Database error: {0}")]
    Database(String),

    /// Task broker connectivity errors
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Per-task failure surfaced outside the daemon (e.g. the one-shot CLI)
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Generic errors with context
    #[error("{0}")]
    Other(String),
}

/// Failure category carried on the wire in error results
///
/// The serialized names are part of the outbound message contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Client-caused, non-retriable
    MalformedQuery,
    /// No mapping for a domain/comparator combination, non-retriable
    UnsupportedRule,
    /// Internal compiler inconsistency, non-retriable
    CompilationError,
    /// Database execution failure
    ExecutionError,
    /// Result publication failure
    PublishError,
    /// Task abandoned after its hard timeout
    Timeout,
}

impl ErrorCategory {
    /// Returns the wire name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedQuery => "MalformedQuery",
            Self::UnsupportedRule => "UnsupportedRule",
            Self::CompilationError => "CompilationError",
            Self::ExecutionError => "ExecutionError",
            Self::PublishError => "PublishError",
            Self::Timeout => "Timeout",
        }
    }

    /// Whether operators should be alerted when this category occurs
    ///
    /// Unsupported rules and compilation errors indicate a gap in the
    /// rule mapping rather than a bad request.
    pub fn needs_operator_attention(&self) -> bool {
        matches!(self, Self::UnsupportedRule | Self::CompilationError)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task error taxonomy
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// The inbound payload is not a valid query specification
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// A rule's domain/comparator combination has no SQL mapping
    #[error("Unsupported rule: {0}")]
    UnsupportedRule(String),

    /// Internal inconsistency while building the statement
    #[error("Compilation error: {0}")]
    Compilation(String),

    /// Database execution failed
    #[error("Execution error: {message}")]
    Execution {
        /// Error message from the executor
        message: String,
        /// Whether retrying the same statement may succeed
        transient: bool,
    },

    /// Publishing the result failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// The task exceeded its hard timeout and was abandoned
    #[error("Task timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl TaskError {
    /// Creates a transient execution error (connection loss, pool timeout, ...)
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a permanent execution error (bad SQL, missing table, ...)
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns the wire category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MalformedQuery(_) => ErrorCategory::MalformedQuery,
            Self::UnsupportedRule(_) => ErrorCategory::UnsupportedRule,
            Self::Compilation(_) => ErrorCategory::CompilationError,
            Self::Execution { .. } => ErrorCategory::ExecutionError,
            Self::Publish(_) => ErrorCategory::PublishError,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    /// Whether the execution stage may be retried after this error
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Execution { transient: true, .. })
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        TallyError::Io(err.to_string())
    }
}

// Conversion from serde_json::Error
impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

// Conversion from toml parse errors
impl From<toml::de::Error> for TallyError {
    fn from(err: toml::de::Error) -> Self {
        TallyError::Configuration(format!("TOML parse error: {err}"))
    }
}
