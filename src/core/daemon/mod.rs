//! Task lifecycle daemon
//!
//! Pulls tasks from a [`TaskChannel`](crate::adapters::broker::TaskChannel),
//! resolves them with bounded concurrency, publishes a result for every task
//! and acknowledges the inbound message only after the result is out (or the
//! publish attempts run out).

pub mod lifecycle;
pub mod retry;
pub mod stats;
pub mod task;
pub mod worker;

pub use lifecycle::{InvalidTransition, RetryDecision, TaskLifecycle, TaskState};
pub use retry::RetryPolicy;
pub use stats::{DaemonStats, StatsSnapshot};
pub use task::Task;
pub use worker::{Daemon, DaemonSettings};
