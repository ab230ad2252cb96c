//! CLI interface and argument parsing
//!
//! This module provides the command-line interface for Tally using clap.

pub mod commands;

use crate::config::{load_config, LoggingConfig};
use clap::{Parser, Subcommand};

/// Tally - cohort discovery task resolver
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(version, about, long_about = None)]
#[command(author = "Tally Contributors")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tally.toml", env = "TALLY_CONFIG")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "TALLY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the task API and resolve tasks until interrupted
    Daemon(commands::daemon::DaemonArgs),

    /// Resolve a single task message from a file
    Query(commands::query::QueryArgs),

    /// Validate configuration file
    ValidateConfig(commands::validate::ValidateArgs),
}

impl Cli {
    /// Log level and logging configuration to start with
    ///
    /// The daemon logs the way its configuration file says (including file
    /// logging); one-shot commands log to the console only. `--log-level`
    /// always wins.
    pub fn logging_settings(&self) -> (String, LoggingConfig) {
        let from_file = match self.command {
            Commands::Daemon(_) => load_config(&self.config).ok(),
            Commands::Query(_) | Commands::ValidateConfig(_) => None,
        };
        let (level, logging) = match from_file {
            Some(config) => (config.application.log_level, config.logging),
            None => ("info".to_string(), LoggingConfig::console_only()),
        };
        (self.log_level.clone().unwrap_or(level), logging)
    }
}
