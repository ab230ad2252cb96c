//! PostgreSQL client implementation
//!
//! Owns the deadpool connection pool for the CDM database and hands out
//! session-configured connections.

use crate::config::schema::DatabaseConfig;
use crate::domain::{Result, TallyError};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::{CancelToken, NoTls};

/// PostgreSQL client for Tally
///
/// Connections handed out by [`PostgreSQLClient::get_connection`] are
/// read-only and carry the configured statement timeout.
pub struct PostgreSQLClient {
    /// Connection pool
    pool: Pool,

    /// TLS connector, `None` when TLS is disabled
    tls: Option<MakeTlsConnector>,

    /// Configuration
    config: DatabaseConfig,
}

impl PostgreSQLClient {
    /// Create a new PostgreSQL client
    ///
    /// The pool connects lazily; use [`PostgreSQLClient::test_connection`]
    /// to check connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is invalid or the pool
    /// cannot be built.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let mut pg_config: tokio_postgres::Config =
            config.connection_string.expose_secret().as_str().parse().map_err(|e| {
                TallyError::Configuration(format!("Invalid PostgreSQL connection string: {e}"))
            })?;
        pg_config.connect_timeout(Duration::from_secs(config.connection_timeout_seconds));
        pg_config.application_name("tally");

        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let (manager, tls) = match config.ssl_mode.as_str() {
            "disable" => {
                pg_config.ssl_mode(SslMode::Disable);
                (Manager::from_config(pg_config, NoTls, manager_config), None)
            }
            mode => {
                pg_config.ssl_mode(if mode == "require" {
                    SslMode::Require
                } else {
                    SslMode::Prefer
                });
                let connector = native_tls::TlsConnector::builder().build().map_err(|e| {
                    TallyError::Configuration(format!("Failed to build TLS connector: {e}"))
                })?;
                let tls = MakeTlsConnector::new(connector);
                (
                    Manager::from_config(pg_config, tls.clone(), manager_config),
                    Some(tls),
                )
            }
        };

        let timeout = Some(Duration::from_secs(config.connection_timeout_seconds));
        let pool = Pool::builder(manager)
            .max_size(config.max_connections)
            .wait_timeout(timeout)
            .create_timeout(timeout)
            .recycle_timeout(timeout)
            .runtime(deadpool_postgres::Runtime::Tokio1)
            .build()
            .map_err(|e| {
                TallyError::Database(format!("Failed to create connection pool: {e}"))
            })?;

        Ok(Self { pool, tls, config })
    }

    /// Test the connection to PostgreSQL
    ///
    /// Checks out a connection and runs `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the pool or query fails.
    pub async fn test_connection(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| TallyError::Database(format!("Failed to get connection from pool: {e}")))?;

        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| TallyError::Database(format!("Connection test failed: {e}")))?;

        tracing::info!(
            connection = %self.connection_string_safe(),
            "PostgreSQL connection test successful"
        );
        Ok(())
    }

    /// Get a session-configured connection from the pool
    ///
    /// The connection returns to the pool when the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns the pool error if no connection can be checked out, or the
    /// session setup error.
    pub async fn get_connection(&self) -> std::result::Result<Object, ConnectionError> {
        let client = self.pool.get().await.map_err(ConnectionError::Pool)?;

        let session = format!(
            "SET statement_timeout = {}; SET default_transaction_read_only = on",
            self.config.statement_timeout_seconds * 1000
        );
        client
            .batch_execute(&session)
            .await
            .map_err(ConnectionError::Session)?;

        Ok(client)
    }

    /// Sends a cancel request for whatever `token`'s connection is running
    pub async fn cancel(&self, token: CancelToken) -> std::result::Result<(), tokio_postgres::Error> {
        match &self.tls {
            Some(tls) => token.cancel_query(tls.clone()).await,
            None => token.cancel_query(NoTls).await,
        }
    }

    /// Schema the CDM tables live in
    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    /// Get the connection string (without credentials)
    pub fn connection_string_safe(&self) -> String {
        self.config.connection_string_safe()
    }

    /// Get the pool statistics
    pub fn pool_status(&self) -> deadpool_postgres::Status {
        self.pool.status()
    }
}

/// Failure to obtain a ready connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Pool checkout failed (timeout, connect error)
    #[error("Failed to get connection from pool: {0}")]
    Pool(#[source] PoolError),
    /// Session setup statement failed
    #[error("Failed to configure session: {0}")]
    Session(#[source] tokio_postgres::Error),
}
