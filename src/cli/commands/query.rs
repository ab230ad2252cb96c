//! Query command implementation
//!
//! Resolves one task message read from a file through the same pipeline the
//! daemon uses, and writes the JSON result to a file.

use super::{exit_code, EXIT_CONFIG, EXIT_OK, EXIT_TASK_FAILED};
use crate::adapters::broker::{Delivery, Receipt};
use crate::adapters::database::create_executor;
use crate::config::{load_config, TallyConfig};
use crate::core::daemon::{RetryPolicy, Task, TaskLifecycle};
use crate::core::resolver::Resolver;
use crate::domain::errors::TaskError;
use crate::domain::ids::CollectionId;
use crate::domain::outcome::{Status, TaskResult};
use anyhow::Context;
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Arguments for the query command
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Task message to resolve (JSON file)
    #[arg(long)]
    pub body: PathBuf,

    /// File to write the result to (must end in .json)
    #[arg(long, default_value = "output.json")]
    pub output: PathBuf,
}

impl QueryArgs {
    /// Execute the query command
    pub async fn execute(&self, config_path: &str) -> anyhow::Result<i32> {
        if let Err(message) = check_output_path(&self.output) {
            eprintln!("{message}");
            return Ok(EXIT_CONFIG);
        }

        let config = match load_config(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };

        let payload = tokio::fs::read(&self.body)
            .await
            .with_context(|| format!("Failed to read task message {}", self.body.display()))?;

        let executor = match create_executor(&config.database) {
            Ok(executor) => executor,
            Err(e) => {
                eprintln!("{e}");
                return Ok(exit_code(&e));
            }
        };
        let resolver = Resolver::from_config(&config, executor)?;

        let result = resolve_once(&config, &resolver, payload).await?;

        let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        tokio::fs::write(&self.output, json)
            .await
            .with_context(|| format!("Failed to write {}", self.output.display()))?;

        tracing::info!(
            correlation_id = %result.correlation_id,
            output = %self.output.display(),
            "Saved result"
        );
        println!("Saved result to {}", self.output.display());

        Ok(match result.status {
            Status::Ok => EXIT_OK,
            Status::Error => EXIT_TASK_FAILED,
        })
    }
}

/// Resolves a single payload under the configured task timeout
///
/// # Errors
///
/// Returns an error if the configured collection id is invalid.
pub async fn resolve_once(
    config: &TallyConfig,
    resolver: &Resolver,
    payload: Vec<u8>,
) -> anyhow::Result<TaskResult> {
    let default_reply_to = CollectionId::new(config.broker.collection_id.clone())
        .map_err(|e| anyhow::anyhow!("broker.collection_id: {e}"))?;
    let delivery = Delivery {
        receipt: Receipt::new(format!("cli-{}", uuid::Uuid::new_v4())),
        payload,
    };
    let task = Task::from_delivery(delivery, &default_reply_to);

    let mut lifecycle = TaskLifecycle::new(
        config.daemon.execution_retry.policy(),
        RetryPolicy::no_retry(),
    );
    let timeout = Duration::from_secs(config.daemon.task_timeout_seconds);

    let result = match tokio::time::timeout(timeout, resolver.resolve(&task, &mut lifecycle)).await
    {
        Ok(result) => result,
        Err(_) => TaskResult::failure(
            task.correlation_id.clone(),
            task.reply_to.clone(),
            &TaskError::Timeout(timeout),
        ),
    };
    Ok(result)
}

fn check_output_path(path: &Path) -> Result<(), String> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(()),
        _ => Err(format!(
            "Please specify a JSON file (ending in '.json'), got {}",
            path.display()
        )),
    }
}
