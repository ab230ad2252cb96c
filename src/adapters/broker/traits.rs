//! Task channel abstraction
//!
//! The daemon consumes tasks and publishes results only through
//! [`TaskChannel`], so its retry and acknowledgement policy can be driven by
//! an in-memory channel in tests.

use crate::domain::errors::TaskError;
use crate::domain::outcome::TaskResult;
use crate::domain::Result;
use async_trait::async_trait;
use std::fmt;

/// Broker-issued handle identifying one delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(String);

impl Receipt {
    /// Wraps a broker handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the handle as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound message
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Handle used to acknowledge the message
    pub receipt: Receipt,
    /// Raw message body
    pub payload: Vec<u8>,
}

/// Inbound task / outbound result channel
#[async_trait]
pub trait TaskChannel: Send + Sync {
    /// Fetches the next task, or `None` if none is waiting
    ///
    /// # Errors
    ///
    /// Returns a broker error if the broker cannot be reached.
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Publishes a result to its destination
    ///
    /// # Errors
    ///
    /// Returns `TaskError::Publish` when delivery failed and may be retried.
    async fn publish(&self, result: &TaskResult) -> std::result::Result<(), TaskError>;

    /// Removes a delivery from the broker once it has been answered
    ///
    /// # Errors
    ///
    /// Returns a broker error if the acknowledgement could not be sent.
    async fn acknowledge(&self, receipt: &Receipt) -> Result<()>;
}
