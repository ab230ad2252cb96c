//! Configuration management for Tally.
//!
//! Tally reads one TOML file, constructed once at startup and passed down
//! explicitly to the daemon, compiler and adapters. Loading supports:
//! - Environment variable substitution (`${VAR_NAME}`)
//! - `TALLY_<SECTION>_<KEY>` environment overrides
//! - Default values for optional settings
//! - Validation of every section
//!
//! # Example Configuration
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [database]
//! connection_string = "postgresql://tally:${TALLY_DB_PASSWORD}@db:5432/omop"
//! schema = "cdm"
//! statement_timeout_seconds = 300
//!
//! [broker]
//! base_url = "https://tasks.example.org/api"
//! username = "tally"
//! password = "${TALLY_BROKER_PASSWORD}"
//! collection_id = "RQ-CC-1234"
//!
//! [daemon]
//! concurrency = 4
//! task_timeout_seconds = 600
//!
//! [daemon.execution_retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//!
//! [disclosure]
//! threshold = 10
//! rounding = 10
//! ```
//!
//! ```rust,no_run
//! use tally::config::load_config;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("tally.toml")?;
//! println!("Concurrency: {}", config.daemon.concurrency);
//! # Ok(())
//! # }
//! ```

pub mod loader;
pub mod schema;
pub mod secret;

// Re-export commonly used types
pub use loader::load_config;
pub use schema::{
    ApplicationConfig, BrokerConfig, DaemonConfig, DatabaseConfig, DisclosureConfig,
    LoggingConfig, QueryConfig, RetryConfig, TallyConfig,
};
pub use secret::{secret_string, SecretString, SecretValue};
