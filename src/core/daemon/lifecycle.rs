//! Per-task lifecycle state machine
//!
//! ```text
//! RECEIVED -> COMPILING -> EXECUTING -> SAFEGUARDING -> PUBLISHING -> ACKNOWLEDGED
//!     \           \            \              \              \
//!      +-----------+------------+--------------+--------------+--> FAILED(reason)
//! ```
//!
//! The lifecycle also owns the execution and publish retry policies, so the
//! retry decisions can be tested without a broker or a database.

use super::retry::RetryPolicy;
use crate::domain::errors::{ErrorCategory, TaskError};
use crate::domain::ids::CorrelationId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// State of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Taken from the channel
    Received,
    /// Being validated and compiled
    Compiling,
    /// Statement running against the database
    Executing,
    /// Disclosure control being applied
    Safeguarding,
    /// Result being published
    Publishing,
    /// Result published and inbound message acknowledged
    Acknowledged,
    /// Terminal failure
    Failed(ErrorCategory),
}

impl TaskState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed(_))
    }

    /// Name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Compiling => "COMPILING",
            Self::Executing => "EXECUTING",
            Self::Safeguarding => "SAFEGUARDING",
            Self::Publishing => "PUBLISHING",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Failed(_) => "FAILED",
        }
    }

    fn successor(&self) -> Option<TaskState> {
        match self {
            Self::Received => Some(Self::Compiling),
            Self::Compiling => Some(Self::Executing),
            Self::Executing => Some(Self::Safeguarding),
            Self::Safeguarding => Some(Self::Publishing),
            Self::Publishing => Some(Self::Acknowledged),
            Self::Acknowledged | Self::Failed(_) => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "FAILED({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid task transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State the task was in
    pub from: TaskState,
    /// Requested state
    pub to: TaskState,
}

/// Logs a rejected transition against its task
///
/// Returns whether the transition was applied. A rejected transition never
/// stops the task from being answered.
pub fn applied(
    correlation_id: &CorrelationId,
    outcome: Result<(), InvalidTransition>,
) -> bool {
    match outcome {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(correlation_id = %correlation_id, error = %e, "Lifecycle inconsistency");
            false
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    Retry(Duration),
    /// Budget exhausted or failure not retriable
    GiveUp,
}

/// State machine and retry bookkeeping for one task
#[derive(Debug, Clone)]
pub struct TaskLifecycle {
    state: TaskState,
    execution_policy: RetryPolicy,
    publish_policy: RetryPolicy,
    execution_attempts: u32,
    publish_attempts: u32,
}

impl TaskLifecycle {
    /// Creates a lifecycle in `Received`
    pub fn new(execution_policy: RetryPolicy, publish_policy: RetryPolicy) -> Self {
        Self {
            state: TaskState::Received,
            execution_policy,
            publish_policy,
            execution_attempts: 0,
            publish_attempts: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Execution attempts made so far
    pub fn execution_attempts(&self) -> u32 {
        self.execution_attempts
    }

    /// Publish attempts made so far
    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts
    }

    /// Execution retry policy
    pub fn execution_policy(&self) -> &RetryPolicy {
        &self.execution_policy
    }

    /// Publish retry policy
    pub fn publish_policy(&self) -> &RetryPolicy {
        &self.publish_policy
    }

    /// Moves to the next state on the success path
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless `to` directly follows the current state.
    pub fn advance(&mut self, to: TaskState) -> Result<(), InvalidTransition> {
        if self.state.successor() != Some(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Moves to `Failed(reason)`
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] if the task is already terminal.
    pub fn fail(&mut self, reason: ErrorCategory) -> Result<(), InvalidTransition> {
        let to = TaskState::Failed(reason);
        if self.state.is_terminal() {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Records a failed execution attempt and decides whether to retry
    ///
    /// Only transient execution errors are retried.
    pub fn record_execution_failure(&mut self, error: &TaskError) -> RetryDecision {
        self.execution_attempts += 1;
        if error.is_retriable() && self.execution_policy.allows_another(self.execution_attempts) {
            RetryDecision::Retry(self.execution_policy.delay_for(self.execution_attempts))
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Records a successful execution attempt
    pub fn record_execution_success(&mut self) {
        self.execution_attempts += 1;
    }

    /// Records a failed publish attempt and decides whether to retry
    pub fn record_publish_failure(&mut self) -> RetryDecision {
        self.publish_attempts += 1;
        if self.publish_policy.allows_another(self.publish_attempts) {
            RetryDecision::Retry(self.publish_policy.delay_for(self.publish_attempts))
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Records a successful publish attempt
    pub fn record_publish_success(&mut self) {
        self.publish_attempts += 1;
    }
}
