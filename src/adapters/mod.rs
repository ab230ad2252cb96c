//! External system integrations for Tally.
//!
//! - [`broker`] - Task channel (receive / publish / acknowledge) and its HTTP task API implementation
//! - [`database`] - Query executor abstraction (trait-based)
//! - [`postgresql`] - PostgreSQL implementation of the executor
//!
//! # Design Pattern
//!
//! Adapters isolate external dependencies behind traits so the resolver and
//! daemon can be tested with in-memory implementations.
//!
//! ```rust,no_run
//! use tally::adapters::database::create_executor;
//! use tally::config::load_config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("tally.toml")?;
//! let executor = create_executor(&config.database)?;
//! executor.test_connection().await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod database;
pub mod postgresql;
