//! Database abstraction traits
//!
//! Resolver logic only ever sees a [`QueryExecutor`]: it hands over a
//! compiled statement and gets raw aggregates back. Connection checkout,
//! timeouts and cancellation stay inside the implementation.

use crate::core::compiler::CompiledQuery;
use crate::domain::errors::TaskError;
use async_trait::async_trait;

/// Bucket key used when the dimension value is NULL
pub const UNKNOWN_BUCKET: &str = "Unknown";

/// Raw, unsafeguarded result of an aggregate statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawAggregate {
    /// Single subject count
    Count(u64),
    /// Subject count per raw bucket key, in database order
    Buckets(Vec<(String, u64)>),
}

/// Executes compiled aggregate statements against the CDM database
///
/// Implementations must be safe for concurrent use by many tasks, and must
/// release any connection they check out on every exit path, including when
/// the returned future is dropped.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a compiled statement
    ///
    /// # Errors
    ///
    /// Returns `TaskError::Execution`, flagged transient when retrying the same
    /// statement may succeed (lost connection, pool exhaustion, cancellation).
    async fn execute(&self, query: &CompiledQuery) -> Result<RawAggregate, TaskError>;

    /// Checks that the database is reachable
    ///
    /// # Errors
    ///
    /// Returns a database error if no connection can be made.
    async fn test_connection(&self) -> crate::domain::Result<()>;
}
