//! Logging and observability
//!
//! Structured logging with:
//! - Human-readable console output
//! - JSON log files with rotation (`[logging] local_enabled`)
//! - Configurable log levels, overridable with `RUST_LOG`
//!
//! # Example
//!
//! ```no_run
//! use tally::logging::init_logging;
//! use tally::config::LoggingConfig;
//!
//! let config = LoggingConfig::default();
//! let _guard = init_logging("info", &config).expect("Failed to initialize logging");
//!
//! tracing::info!(correlation_id = "job-1", "Task received");
//! ```

pub mod structured;

pub use structured::{init_logging, parse_log_level, LoggingGuard};

/// Log a task lifecycle transition
///
/// # Example
///
/// ```no_run
/// use tally::log_task_state;
/// use tally::core::daemon::TaskState;
///
/// log_task_state!("job-1", TaskState::Executing);
/// ```
#[macro_export]
macro_rules! log_task_state {
    ($correlation_id:expr, $state:expr) => {
        tracing::debug!(
            correlation_id = %$correlation_id,
            state = %$state,
            "Task state changed"
        );
    };
}

/// Log a retry attempt of a task stage
///
/// # Example
///
/// ```no_run
/// use tally::log_retry_attempt;
/// use std::time::Duration;
///
/// log_retry_attempt!("execute", "job-1", 1, 3, Duration::from_millis(500), "connection reset");
/// ```
#[macro_export]
macro_rules! log_retry_attempt {
    ($stage:expr, $correlation_id:expr, $attempt:expr, $max_attempts:expr, $delay:expr, $error:expr) => {
        tracing::warn!(
            stage = $stage,
            correlation_id = %$correlation_id,
            attempt = $attempt,
            max_attempts = $max_attempts,
            delay_ms = $delay.as_millis() as u64,
            error = %$error,
            "Retrying after failure"
        );
    };
}
