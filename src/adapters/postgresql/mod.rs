//! PostgreSQL integration
//!
//! Pooled, read-only access to an OMOP CDM database.

pub mod client;
pub mod executor;

pub use client::PostgreSQLClient;
pub use executor::PostgreSQLExecutor;
