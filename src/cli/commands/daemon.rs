//! Daemon command implementation
//!
//! Wires configuration, the PostgreSQL executor and the task API channel
//! into a [`Daemon`] and runs it until a shutdown signal arrives.

use super::{exit_code, EXIT_CONFIG, EXIT_FATAL, EXIT_OK};
use crate::adapters::broker::HttpTaskChannel;
use crate::adapters::database::create_executor;
use crate::cli::commands::validate::summary;
use crate::config::load_config;
use crate::core::daemon::{Daemon, DaemonSettings};
use crate::core::resolver::Resolver;
use clap::Args;
use std::sync::Arc;
use tokio::sync::watch;

/// Arguments for the daemon command
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Override the maximum number of tasks in flight
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl DaemonArgs {
    /// Execute the daemon command
    pub async fn execute(
        &self,
        config_path: &str,
        shutdown_signal: watch::Receiver<bool>,
    ) -> anyhow::Result<i32> {
        tracing::info!("Starting daemon command");

        let mut config = match load_config(config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };

        if let Some(concurrency) = self.concurrency {
            tracing::info!(concurrency, "Overriding concurrency from CLI");
            config.daemon.concurrency = concurrency;
            if let Err(e) = config.validate() {
                tracing::error!(error = %e, "Configuration validation failed");
                eprintln!("Configuration validation failed: {e}");
                return Ok(EXIT_CONFIG);
            }
        }

        for line in summary(&config).lines() {
            tracing::debug!("{line}");
        }

        let executor = match create_executor(&config.database) {
            Ok(executor) => executor,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create database executor");
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };

        let resolver = match Resolver::from_config(&config, executor) {
            Ok(resolver) => Arc::new(resolver),
            Err(e) => {
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };

        // A daemon that cannot reach its database cannot answer anything.
        if let Err(e) = resolver.check_database().await {
            tracing::error!(
                error = %e,
                database = %config.database.connection_string_safe(),
                "Database unreachable at startup"
            );
            eprintln!("{e}");
            return Ok(EXIT_FATAL);
        }

        let channel = match HttpTaskChannel::new(&config.broker) {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create task API channel");
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };

        let settings = match DaemonSettings::from_config(&config) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };

        tracing::info!(
            task_api = %config.broker.base_url,
            collection_id = %config.broker.collection_id,
            schema = %config.database.schema,
            threshold = config.disclosure.threshold,
            rounding = config.disclosure.rounding,
            "Polling for tasks"
        );

        let daemon = Daemon::new(channel, resolver, settings);
        let stats = daemon.run(shutdown_signal).await;

        println!(
            "Received {} tasks: {} succeeded, {} failed, {} lost",
            stats.received, stats.succeeded, stats.failed, stats.lost
        );
        Ok(EXIT_OK)
    }
}
