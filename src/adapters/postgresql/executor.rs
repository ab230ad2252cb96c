//! PostgreSQL query executor
//!
//! Runs compiled aggregate statements on a pooled, read-only connection. If
//! the future driving a statement is dropped (for example by the daemon's
//! hard task timeout), a cancel request is sent to the server so the
//! connection is freed instead of finishing a query nobody will read.

use crate::adapters::database::traits::{QueryExecutor, RawAggregate, UNKNOWN_BUCKET};
use crate::adapters::postgresql::client::{ConnectionError, PostgreSQLClient};
use crate::core::compiler::{CompiledQuery, ResultShape, SqlParam};
use crate::domain::errors::TaskError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Row};

/// [`QueryExecutor`] backed by a [`PostgreSQLClient`] pool
#[derive(Clone)]
pub struct PostgreSQLExecutor {
    client: Arc<PostgreSQLClient>,
}

impl PostgreSQLExecutor {
    /// Create a new executor over a client
    pub fn new(client: Arc<PostgreSQLClient>) -> Self {
        Self { client }
    }
}

/// Sends a cancel request on drop unless disarmed
struct CancelOnDrop {
    client: Arc<PostgreSQLClient>,
    token: Option<CancelToken>,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = Arc::clone(&self.client);
        handle.spawn(async move {
            match client.cancel(token).await {
                Ok(()) => tracing::warn!("Cancelled abandoned statement"),
                Err(e) => tracing::error!(error = %e, "Failed to cancel abandoned statement"),
            }
        });
    }
}

#[async_trait]
impl QueryExecutor for PostgreSQLExecutor {
    async fn execute(&self, query: &CompiledQuery) -> Result<RawAggregate, TaskError> {
        let connection = self
            .client
            .get_connection()
            .await
            .map_err(connection_error)?;

        let params: Vec<&(dyn ToSql + Sync)> = query.params.iter().map(as_sql).collect();

        let guard = CancelOnDrop {
            client: Arc::clone(&self.client),
            token: Some(connection.cancel_token()),
        };

        tracing::debug!(
            sql = %query.sql,
            params = query.params.len(),
            "Executing aggregate statement"
        );

        let result = match query.shape {
            ResultShape::Count => connection
                .query_one(query.sql.as_str(), &params)
                .await
                .map_err(query_error)
                .and_then(|row| read_count(&row)),
            ResultShape::Buckets(_) => connection
                .query(query.sql.as_str(), &params)
                .await
                .map_err(query_error)
                .and_then(|rows| read_buckets(&rows)),
        };

        guard.disarm();
        result
    }

    async fn test_connection(&self) -> crate::domain::Result<()> {
        self.client.test_connection().await
    }
}

fn as_sql(param: &SqlParam) -> &(dyn ToSql + Sync) {
    match param {
        SqlParam::Int(v) => v,
        SqlParam::Float(v) => v,
        SqlParam::Date(v) => v,
    }
}

fn read_count(row: &Row) -> Result<RawAggregate, TaskError> {
    let count: i64 = row
        .try_get(0)
        .map_err(|e| TaskError::permanent(format!("Unexpected count column: {e}")))?;
    Ok(RawAggregate::Count(non_negative(count)?))
}

fn read_buckets(rows: &[Row]) -> Result<RawAggregate, TaskError> {
    rows.iter()
        .map(|row| {
            let key: Option<String> = row
                .try_get(0)
                .map_err(|e| TaskError::permanent(format!("Unexpected bucket column: {e}")))?;
            let count: i64 = row
                .try_get(1)
                .map_err(|e| TaskError::permanent(format!("Unexpected count column: {e}")))?;
            Ok((
                key.unwrap_or_else(|| UNKNOWN_BUCKET.to_string()),
                non_negative(count)?,
            ))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(RawAggregate::Buckets)
}

fn non_negative(count: i64) -> Result<u64, TaskError> {
    u64::try_from(count).map_err(|_| TaskError::permanent(format!("Negative count {count}")))
}

fn connection_error(err: ConnectionError) -> TaskError {
    match &err {
        ConnectionError::Pool(_) => TaskError::transient(err.to_string()),
        ConnectionError::Session(e) => classify(e, err.to_string()),
    }
}

fn query_error(err: tokio_postgres::Error) -> TaskError {
    let message = format!("Query failed: {err}");
    classify(&err, message)
}

fn classify(err: &tokio_postgres::Error, message: String) -> TaskError {
    if err.is_closed() {
        return TaskError::transient(message);
    }
    match err.code() {
        Some(state) if is_transient_sqlstate(state.code()) => TaskError::transient(message),
        Some(_) => TaskError::permanent(message),
        // No SQLSTATE means an I/O or protocol failure, not a statement error.
        None => TaskError::transient(message),
    }
}

/// Whether a SQLSTATE describes a condition that may clear on retry
///
/// Connection exceptions (08), operator intervention (57, which includes
/// statement timeouts and cancellations), transaction rollbacks such as
/// serialization failures (40) and insufficient resources (53).
fn is_transient_sqlstate(code: &str) -> bool {
    ["08", "57", "40", "53"]
        .iter()
        .any(|class| code.starts_with(class))
}
