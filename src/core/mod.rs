//! Core logic for Tally.
//!
//! # Modules
//!
//! - [`compiler`] - Query specification to parameterized SQL
//! - [`disclosure`] - Minimum-cell-size suppression and rounding
//! - [`resolver`] - Per-task pipeline from raw payload to result
//! - [`daemon`] - Task lifecycle, retries and the bounded worker loop
//!
//! # Task Workflow
//!
//! 1. **Receive**: take a task from the channel (blocks while N are in flight)
//! 2. **Compile**: validate the payload and compile the query
//! 3. **Execute**: run the aggregate statement, retrying transient failures
//! 4. **Safeguard**: apply disclosure control to the raw counts
//! 5. **Publish**: send the result, retrying independently of execution
//! 6. **Acknowledge**: remove the inbound message
//!
//! # Example
//!
//! ```rust,no_run
//! use tally::adapters::broker::HttpTaskChannel;
//! use tally::adapters::database::create_executor;
//! use tally::config::load_config;
//! use tally::core::daemon::{Daemon, DaemonSettings};
//! use tally::core::resolver::Resolver;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("tally.toml")?;
//! let executor = create_executor(&config.database)?;
//! let resolver = Arc::new(Resolver::from_config(&config, executor)?);
//! let channel = Arc::new(HttpTaskChannel::new(&config.broker)?);
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let daemon = Daemon::new(channel, resolver, DaemonSettings::from_config(&config)?);
//! let stats = daemon.run(shutdown_rx).await;
//! println!("Resolved {} tasks", stats.completed());
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod daemon;
pub mod disclosure;
pub mod resolver;
