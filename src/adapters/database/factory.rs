//! Database executor factory

use crate::adapters::database::traits::QueryExecutor;
use crate::adapters::postgresql::{PostgreSQLClient, PostgreSQLExecutor};
use crate::config::schema::DatabaseConfig;
use crate::domain::Result;
use std::sync::Arc;

/// Create the query executor for the configured CDM database
///
/// # Errors
///
/// Returns an error if the connection pool cannot be built
pub fn create_executor(config: &DatabaseConfig) -> Result<Arc<dyn QueryExecutor>> {
    tracing::info!(schema = %config.schema, "Creating PostgreSQL executor");
    let client = PostgreSQLClient::new(config.clone())?;
    tracing::debug!(connection = %client.connection_string_safe(), "PostgreSQL pool created");
    Ok(Arc::new(PostgreSQLExecutor::new(Arc::new(client))))
}
