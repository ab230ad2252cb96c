//! Bounded worker loop
//!
//! A permit from an N-permit semaphore is acquired before every receive, so
//! at most N tasks are in flight and consumption suspends while all workers
//! are busy. The permit moves into the spawned worker and is released when
//! the worker ends, whichever way it ends.

use super::lifecycle::{applied, RetryDecision, TaskLifecycle, TaskState};
use super::retry::RetryPolicy;
use super::stats::{DaemonStats, StatsSnapshot};
use super::task::Task;
use crate::adapters::broker::TaskChannel;
use crate::config::TallyConfig;
use crate::core::resolver::Resolver;
use crate::domain::errors::TaskError;
use crate::domain::ids::CollectionId;
use crate::domain::outcome::{Status, TaskResult};
use crate::domain::{Result, TallyError};
use crate::{log_retry_attempt, log_task_state};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

/// Runtime settings of the worker loop
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Maximum number of tasks in flight
    pub concurrency: usize,
    /// Hard limit on compile + execute for one task
    pub task_timeout: Duration,
    /// Time allowed for in-flight tasks to finish after shutdown
    pub shutdown_timeout: Duration,
    /// Execution retry policy
    pub execution_retry: RetryPolicy,
    /// Publish retry policy
    pub publish_retry: RetryPolicy,
    /// Sleep after an empty poll
    pub polling_interval: Duration,
    /// Backoff after receive errors
    pub receive_backoff: RetryPolicy,
    /// Destination for results of tasks that do not name one
    pub default_reply_to: CollectionId,
}

impl DaemonSettings {
    /// Builds settings from the configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the broker collection id is invalid.
    pub fn from_config(config: &TallyConfig) -> Result<Self> {
        let default_reply_to = CollectionId::new(config.broker.collection_id.clone())
            .map_err(|e| TallyError::Configuration(format!("broker.collection_id: {e}")))?;

        Ok(Self {
            concurrency: config.daemon.concurrency,
            task_timeout: Duration::from_secs(config.daemon.task_timeout_seconds),
            shutdown_timeout: Duration::from_secs(config.daemon.shutdown_timeout_seconds),
            execution_retry: config.daemon.execution_retry.policy(),
            publish_retry: config.daemon.publish_retry.policy(),
            polling_interval: Duration::from_millis(config.broker.polling_interval_ms),
            receive_backoff: RetryPolicy::unbounded(
                Duration::from_millis(config.broker.initial_backoff_ms),
                Duration::from_millis(config.broker.max_backoff_ms),
            ),
            default_reply_to,
        })
    }
}

/// Task-resolving daemon
pub struct Daemon {
    channel: Arc<dyn TaskChannel>,
    resolver: Arc<Resolver>,
    settings: DaemonSettings,
    stats: Arc<DaemonStats>,
}

impl Daemon {
    /// Creates a daemon
    pub fn new(channel: Arc<dyn TaskChannel>, resolver: Arc<Resolver>, settings: DaemonSettings) -> Self {
        Self {
            channel,
            resolver,
            settings,
            stats: Arc::new(DaemonStats::new()),
        }
    }

    /// Live counters
    pub fn stats(&self) -> Arc<DaemonStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until `shutdown` turns true, then drains in-flight tasks
    ///
    /// Returns the final counters. Tasks still running when the shutdown
    /// timeout expires are left to be redelivered by the broker.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> StatsSnapshot {
        let permits = self.settings.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut receive_failures: u32 = 0;

        tracing::info!(
            concurrency = permits,
            task_timeout_secs = self.settings.task_timeout.as_secs(),
            "Daemon started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Not raced against shutdown: a job fetched from the API is
            // already dequeued and must not be dropped on the floor.
            match self.channel.receive().await {
                Ok(Some(delivery)) => {
                    receive_failures = 0;
                    let task = Task::from_delivery(delivery, &self.settings.default_reply_to);
                    self.stats.record_received();
                    log_task_state!(task.correlation_id, TaskState::Received);
                    self.spawn_worker(task, permit);
                }
                Ok(None) => {
                    drop(permit);
                    if sleep_or_shutdown(self.settings.polling_interval, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    receive_failures = receive_failures.saturating_add(1);
                    let delay = self.settings.receive_backoff.delay_for(receive_failures);
                    tracing::warn!(
                        error = %e,
                        consecutive_failures = receive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "Receiving tasks failed, backing off"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            timeout_secs = self.settings.shutdown_timeout.as_secs(),
            in_flight = permits - semaphore.available_permits(),
            "Shutdown requested, draining in-flight tasks"
        );
        let all = u32::try_from(permits).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.settings.shutdown_timeout, semaphore.acquire_many(all)).await {
            Ok(_) => tracing::info!("All in-flight tasks finished"),
            Err(_) => tracing::warn!(
                in_flight = permits - semaphore.available_permits(),
                "Shutdown timeout expired with tasks still in flight"
            ),
        }

        let snapshot = self.stats.snapshot();
        tracing::info!(
            received = snapshot.received,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            lost = snapshot.lost,
            "Daemon stopped"
        );
        snapshot
    }

    fn spawn_worker(&self, task: Task, permit: OwnedSemaphorePermit) {
        let worker = Worker {
            channel: Arc::clone(&self.channel),
            resolver: Arc::clone(&self.resolver),
            settings: self.settings.clone(),
            stats: Arc::clone(&self.stats),
        };
        tokio::spawn(async move {
            let _permit = permit;
            worker.process(task).await;
        });
    }
}

/// Everything one spawned worker needs
struct Worker {
    channel: Arc<dyn TaskChannel>,
    resolver: Arc<Resolver>,
    settings: DaemonSettings,
    stats: Arc<DaemonStats>,
}

impl Worker {
    async fn process(&self, task: Task) {
        let mut lifecycle =
            TaskLifecycle::new(self.settings.execution_retry, self.settings.publish_retry);

        let result = self.resolve(&task, &mut lifecycle).await;
        self.publish(&task, &result, &mut lifecycle).await;

        if let Err(e) = self.channel.acknowledge(&task.receipt).await {
            tracing::error!(
                correlation_id = %task.correlation_id,
                receipt = %task.receipt,
                error = %e,
                "Failed to acknowledge task"
            );
        }
        if lifecycle.state() == TaskState::Publishing {
            applied(&task.correlation_id, lifecycle.advance(TaskState::Acknowledged));
        }
        log_task_state!(task.correlation_id, lifecycle.state());
    }

    /// Resolves under the hard timeout, isolating panics
    async fn resolve(&self, task: &Task, lifecycle: &mut TaskLifecycle) -> TaskResult {
        let timeout = self.settings.task_timeout;
        let resolution = AssertUnwindSafe(self.resolver.resolve(task, lifecycle)).catch_unwind();

        let failure = match tokio::time::timeout(timeout, resolution).await {
            Ok(Ok(result)) => return result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(correlation_id = %task.correlation_id, panic = %message, "Task panicked");
                TaskError::permanent(format!("task aborted: {message}"))
            }
            // Dropping the resolution drops its connection and cancels the statement.
            Err(_) => TaskError::Timeout(timeout),
        };

        if !lifecycle.state().is_terminal() {
            applied(&task.correlation_id, lifecycle.fail(failure.category()));
        }
        tracing::warn!(
            correlation_id = %task.correlation_id,
            code = %failure.category(),
            error = %failure,
            "Task abandoned"
        );
        TaskResult::failure(task.correlation_id.clone(), task.reply_to.clone(), &failure)
    }

    /// Publishes with retries; gives up once publish attempts run out
    async fn publish(&self, task: &Task, result: &TaskResult, lifecycle: &mut TaskLifecycle) {
        loop {
            match self.channel.publish(result).await {
                Ok(()) => {
                    lifecycle.record_publish_success();
                    match result.status {
                        Status::Ok => self.stats.record_succeeded(),
                        Status::Error => self.stats.record_failed(),
                    }
                    tracing::info!(
                        correlation_id = %task.correlation_id,
                        reply_to = %result.reply_to,
                        status = ?result.status,
                        "Result published"
                    );
                    return;
                }
                Err(err) => match lifecycle.record_publish_failure() {
                    RetryDecision::Retry(delay) => {
                        log_retry_attempt!(
                            "publish",
                            task.correlation_id,
                            lifecycle.publish_attempts(),
                            lifecycle.publish_policy().max_attempts,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        self.stats.record_lost();
                        if !lifecycle.state().is_terminal() {
                            applied(&task.correlation_id, lifecycle.fail(err.category()));
                        }
                        tracing::error!(
                            correlation_id = %task.correlation_id,
                            attempts = lifecycle.publish_attempts(),
                            error = %err,
                            "Result lost, acknowledging task anyway"
                        );
                        return;
                    }
                },
            }
        }
    }
}

/// Resolves once `shutdown` is true; never resolves if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps for `duration`; returns true if shutdown was requested meanwhile
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        () = shutdown_requested(shutdown) => true,
        () = tokio::time::sleep(duration) => false,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
