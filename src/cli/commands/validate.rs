//! Validate config command implementation
//!
//! Loads the configuration file the same way the daemon does and prints a
//! summary with credentials redacted.

use super::{exit_code, EXIT_OK};
use crate::config::{load_config, TallyConfig};
use clap::Args;

/// Arguments for the validate-config command
#[derive(Args, Debug)]
pub struct ValidateArgs {}

impl ValidateArgs {
    /// Execute the validate-config command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        tracing::info!(config_path = %config_path, "Validating configuration");

        println!("Validating configuration file: {config_path}");
        println!();

        let config = match load_config(config_path) {
            Ok(config) => config,
            Err(e) => {
                println!("Configuration is invalid");
                println!("   Error: {e}");
                return Ok(exit_code(&e));
            }
        };

        println!("Configuration is valid");
        println!();
        println!("{}", summary(&config));
        Ok(EXIT_OK)
    }
}

/// Human-readable configuration summary without secrets
pub fn summary(config: &TallyConfig) -> String {
    let daemon = &config.daemon;
    let broker = &config.broker;
    let task_type = broker.task_type.as_deref().unwrap_or("-");

    [
        "Configuration Summary:".to_string(),
        format!("  Log Level: {}", config.application.log_level),
        format!("  Database: {}", config.database.connection_string_safe()),
        format!("  Schema: {}", config.database.schema),
        format!("  Max Connections: {}", config.database.max_connections),
        format!(
            "  Statement Timeout: {}s",
            config.database.statement_timeout_seconds
        ),
        format!("  Task API: {}", broker.base_url),
        format!("  Task API User: {}", broker.username),
        format!("  Collection: {} (type {task_type})", broker.collection_id),
        format!("  Concurrency: {}", daemon.concurrency),
        format!("  Task Timeout: {}s", daemon.task_timeout_seconds),
        format!(
            "  Execution Retries: {} attempts, {}ms initial delay",
            daemon.execution_retry.max_attempts, daemon.execution_retry.initial_delay_ms
        ),
        format!(
            "  Publish Retries: {} attempts, {}ms initial delay",
            daemon.publish_retry.max_attempts, daemon.publish_retry.initial_delay_ms
        ),
        format!(
            "  Disclosure: threshold {}, rounding {}",
            config.disclosure.threshold, config.disclosure.rounding
        ),
        format!(
            "  Query Limits: {} groups, {} rules per group",
            config.query.max_groups, config.query.max_rules_per_group
        ),
        format!(
            "  File Logging: {}",
            if config.logging.local_enabled {
                config.logging.local_path.as_str()
            } else {
                "disabled"
            }
        ),
    ]
    .join("\n")
}
