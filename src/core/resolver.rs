//! Per-task resolution pipeline
//!
//! Query model -> SQL compiler -> executor (with retries) -> disclosure
//! control -> result model. Every failure along the way becomes an error
//! result addressed to the task's correlation id; nothing is dropped.

use crate::adapters::database::{QueryExecutor, RawAggregate, UNKNOWN_BUCKET};
use crate::config::TallyConfig;
use crate::core::compiler::{CompiledQuery, ResultShape, SqlCompiler};
use crate::core::daemon::lifecycle::applied;
use crate::core::daemon::{RetryDecision, Task, TaskLifecycle, TaskState};
use crate::core::disclosure::DisclosurePolicy;
use crate::domain::errors::TaskError;
use crate::domain::outcome::{Payload, TaskResult};
use crate::domain::query::{QueryLimits, TaskMessage};
use crate::{log_retry_attempt, log_task_state};
use std::sync::Arc;

/// Resolves tasks into results
pub struct Resolver {
    compiler: SqlCompiler,
    executor: Arc<dyn QueryExecutor>,
    disclosure: DisclosurePolicy,
    limits: QueryLimits,
}

impl Resolver {
    /// Creates a resolver
    pub fn new(
        compiler: SqlCompiler,
        executor: Arc<dyn QueryExecutor>,
        disclosure: DisclosurePolicy,
        limits: QueryLimits,
    ) -> Self {
        Self {
            compiler,
            executor,
            disclosure,
            limits,
        }
    }

    /// Creates a resolver from the configuration
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the database schema name is invalid.
    pub fn from_config(
        config: &TallyConfig,
        executor: Arc<dyn QueryExecutor>,
    ) -> crate::domain::Result<Self> {
        Ok(Self::new(
            SqlCompiler::new(&config.database.schema)?,
            executor,
            config.disclosure.policy(),
            config.query.limits(),
        ))
    }

    /// Disclosure policy applied to every result
    pub fn disclosure(&self) -> &DisclosurePolicy {
        &self.disclosure
    }

    /// Checks that the database is reachable
    ///
    /// # Errors
    ///
    /// Returns a database error if no connection can be made.
    pub async fn check_database(&self) -> crate::domain::Result<()> {
        self.executor.test_connection().await
    }

    /// Resolves a task, leaving `lifecycle` in `Publishing` on success or
    /// `Failed` otherwise
    pub async fn resolve(&self, task: &Task, lifecycle: &mut TaskLifecycle) -> TaskResult {
        match self.run(task, lifecycle).await {
            Ok(result) => result,
            Err(err) => {
                let category = err.category();
                applied(&task.correlation_id, lifecycle.fail(category));
                log_task_state!(task.correlation_id, lifecycle.state());
                if category.needs_operator_attention() {
                    tracing::error!(
                        correlation_id = %task.correlation_id,
                        code = %category,
                        error = %err,
                        "Task failed on a rule mapping gap"
                    );
                } else {
                    tracing::warn!(
                        correlation_id = %task.correlation_id,
                        code = %category,
                        error = %err,
                        "Task failed"
                    );
                }
                TaskResult::failure(task.correlation_id.clone(), task.reply_to.clone(), &err)
            }
        }
    }

    async fn run(&self, task: &Task, lifecycle: &mut TaskLifecycle) -> Result<TaskResult, TaskError> {
        advance(task, lifecycle, TaskState::Compiling)?;
        let message = TaskMessage::parse(&task.payload, task.received_on(), &self.limits)?;
        let compiled = self.compiler.compile(&message.query)?;
        tracing::debug!(
            correlation_id = %task.correlation_id,
            output = message.query.output.as_str(),
            rules = message.query.cohort.rule_count(),
            params = compiled.params.len(),
            "Query compiled"
        );

        advance(task, lifecycle, TaskState::Executing)?;
        let raw = self.execute_with_retry(task, &compiled, lifecycle).await?;

        advance(task, lifecycle, TaskState::Safeguarding)?;
        let payload = self.safeguard(raw, compiled.shape)?;

        advance(task, lifecycle, TaskState::Publishing)?;
        Ok(TaskResult::new(
            task.correlation_id.clone(),
            task.reply_to.clone(),
            payload,
        ))
    }

    async fn execute_with_retry(
        &self,
        task: &Task,
        compiled: &CompiledQuery,
        lifecycle: &mut TaskLifecycle,
    ) -> Result<RawAggregate, TaskError> {
        loop {
            match self.executor.execute(compiled).await {
                Ok(raw) => {
                    lifecycle.record_execution_success();
                    return Ok(raw);
                }
                Err(err) => match lifecycle.record_execution_failure(&err) {
                    RetryDecision::Retry(delay) => {
                        log_retry_attempt!(
                            "execute",
                            task.correlation_id,
                            lifecycle.execution_attempts(),
                            lifecycle.execution_policy().max_attempts,
                            delay,
                            err
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => return Err(err),
                },
            }
        }
    }

    /// Applies disclosure control to a raw aggregate
    ///
    /// # Errors
    ///
    /// Returns `Compilation` if the aggregate does not have the shape the
    /// statement was compiled for.
    pub fn safeguard(&self, raw: RawAggregate, shape: ResultShape) -> Result<Payload, TaskError> {
        match (raw, shape) {
            (RawAggregate::Count(count), ResultShape::Count) => {
                Ok(Payload::Availability(self.disclosure.availability(count)))
            }
            (RawAggregate::Buckets(rows), ResultShape::Buckets(dimension)) => {
                let labelled = rows.into_iter().map(|(key, count)| {
                    let label = if key == UNKNOWN_BUCKET {
                        key
                    } else {
                        dimension.bucket_label(&key)
                    };
                    (label, count)
                });
                Ok(Payload::Distribution(
                    self.disclosure.distribution(dimension.name(), labelled),
                ))
            }
            (raw, shape) => Err(TaskError::Compilation(format!(
                "executor returned {raw:?} for a {shape:?} statement"
            ))),
        }
    }
}

fn advance(task: &Task, lifecycle: &mut TaskLifecycle, to: TaskState) -> Result<(), TaskError> {
    lifecycle
        .advance(to)
        .map_err(|e| TaskError::Compilation(e.to_string()))?;
    log_task_state!(task.correlation_id, to);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::broker::{Delivery, Receipt};
    use crate::core::daemon::RetryPolicy;
    use crate::domain::errors::ErrorCategory;
    use crate::domain::ids::CollectionId;
    use crate::domain::outcome::{AvailabilityResult, Cell, Status};
    use crate::domain::query::{Dimension, FactDomain};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Executor replaying scripted outcomes and recording statements
    struct ScriptedExecutor {
        outcomes: Mutex<VecDeque<Result<RawAggregate, TaskError>>>,
        executed: Mutex<Vec<CompiledQuery>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<Result<RawAggregate, TaskError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                executed: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.executed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueryExecutor for ScriptedExecutor {
        async fn execute(&self, query: &CompiledQuery) -> Result<RawAggregate, TaskError> {
            self.executed.lock().unwrap().push(query.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TaskError::permanent("script exhausted")))
        }

        async fn test_connection(&self) -> crate::domain::Result<()> {
            Ok(())
        }
    }

    fn resolver(executor: Arc<ScriptedExecutor>, policy: DisclosurePolicy) -> Resolver {
        Resolver::new(
            SqlCompiler::new("cdm").unwrap(),
            executor,
            policy,
            QueryLimits::default(),
        )
    }

    fn lifecycle() -> TaskLifecycle {
        let execution = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        };
        TaskLifecycle::new(execution, RetryPolicy::no_retry())
    }

    fn task(body: serde_json::Value) -> Task {
        Task::from_delivery(
            Delivery {
                receipt: Receipt::new("r-1"),
                payload: serde_json::to_vec(&body).unwrap(),
            },
            &CollectionId::new("RQ-HOME").unwrap(),
        )
    }

    fn diabetes_adults(output: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "correlation_id": "job-1",
            "reply_to": "RQ-1",
            "query": {
                "output": output,
                "reference_date": "2024-06-01",
                "cohort": {
                    "groups_operator": "AND",
                    "groups": [{
                        "rules_operator": "AND",
                        "rules": [
                            { "domain": "CONDITION", "concept_id": 201820, "comparator": "EQ" },
                            { "domain": "AGE", "comparator": "GE", "value": 18 }
                        ]
                    }]
                }
            }
        })
    }

    #[tokio::test]
    async fn test_small_availability_is_suppressed() {
        let executor = ScriptedExecutor::new(vec![Ok(RawAggregate::Count(3))]);
        let resolver = resolver(executor.clone(), DisclosurePolicy::new(10, 5));
        let mut lifecycle = lifecycle();

        let result = resolver
            .resolve(&task(diabetes_adults(serde_json::json!({"kind": "AVAILABILITY"}))), &mut lifecycle)
            .await;

        assert_eq!(result.status, Status::Ok);
        assert_eq!(result.correlation_id.as_str(), "job-1");
        assert_eq!(result.reply_to.as_str(), "RQ-1");
        assert_eq!(result.payload, Payload::Availability(AvailabilityResult(Cell::Suppressed)));
        assert_eq!(lifecycle.state(), TaskState::Publishing);
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_distribution_by_sex() {
        let executor = ScriptedExecutor::new(vec![Ok(RawAggregate::Buckets(vec![
            ("FEMALE".to_string(), 3),
            ("MALE".to_string(), 12),
        ]))]);
        let resolver = resolver(executor, DisclosurePolicy::new(10, 5));
        let mut lifecycle = lifecycle();

        let result = resolver
            .resolve(
                &task(diabetes_adults(serde_json::json!({"kind": "DISTRIBUTION", "dimension": "SEX"}))),
                &mut lifecycle,
            )
            .await;

        let Payload::Distribution(distribution) = result.payload else {
            panic!("expected a distribution");
        };
        assert_eq!(distribution.dimension, "SEX");
        assert_eq!(distribution.buckets["MALE"], Cell::Count(10));
        assert_eq!(distribution.buckets["FEMALE"], Cell::Suppressed);
    }

    #[tokio::test]
    async fn test_malformed_query_never_reaches_the_database() {
        let executor = ScriptedExecutor::new(vec![Ok(RawAggregate::Count(100))]);
        let resolver = resolver(executor.clone(), DisclosurePolicy::disabled());
        let mut lifecycle = lifecycle();

        let body = serde_json::json!({
            "correlation_id": "job-2",
            "reply_to": "RQ-1",
            "query": { "output": {} }
        });
        let result = resolver.resolve(&task(body), &mut lifecycle).await;

        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error_code(), Some(ErrorCategory::MalformedQuery));
        assert_eq!(result.correlation_id.as_str(), "job-2");
        assert_eq!(
            lifecycle.state(),
            TaskState::Failed(ErrorCategory::MalformedQuery)
        );
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_rule_fails_before_execution() {
        let executor = ScriptedExecutor::new(vec![]);
        let resolver = resolver(executor.clone(), DisclosurePolicy::disabled());
        let mut lifecycle = lifecycle();

        let body = serde_json::json!({
            "correlation_id": "job-3",
            "reply_to": "RQ-1",
            "query": {
                "output": { "kind": "AVAILABILITY" },
                "cohort": { "groups_operator": "AND", "groups": [{
                    "rules_operator": "AND",
                    "rules": [{ "domain": "CONDITION", "concept_id": 201820, "comparator": "GT", "value": 3 }]
                }]}
            }
        });
        let result = resolver.resolve(&task(body), &mut lifecycle).await;

        assert_eq!(result.error_code(), Some(ErrorCategory::UnsupportedRule));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_oversized_within_window_is_a_client_error() {
        let executor = ScriptedExecutor::new(vec![]);
        let resolver = resolver(executor.clone(), DisclosurePolicy::disabled());
        let mut lifecycle = lifecycle();

        let body = serde_json::json!({
            "correlation_id": "job-4",
            "reply_to": "RQ-1",
            "query": {
                "output": { "kind": "AVAILABILITY" },
                "cohort": { "groups_operator": "AND", "groups": [{
                    "rules_operator": "AND",
                    "rules": [{ "domain": "DRUG", "concept_id": 1, "comparator": "WITHIN", "value": 4_000_000_000u64 }]
                }]}
            }
        });
        let result = resolver.resolve(&task(body), &mut lifecycle).await;

        assert_eq!(result.error_code(), Some(ErrorCategory::MalformedQuery));
        assert_eq!(
            lifecycle.state(),
            TaskState::Failed(ErrorCategory::MalformedQuery)
        );
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_matches_single_success() {
        let flaky = ScriptedExecutor::new(vec![
            Err(TaskError::transient("connection reset")),
            Ok(RawAggregate::Count(42)),
        ]);
        let steady = ScriptedExecutor::new(vec![Ok(RawAggregate::Count(42))]);
        let policy = DisclosurePolicy::new(10, 10);
        let body = diabetes_adults(serde_json::json!({"kind": "AVAILABILITY"}));

        let mut flaky_lifecycle = lifecycle();
        let retried = resolver(flaky.clone(), policy)
            .resolve(&task(body.clone()), &mut flaky_lifecycle)
            .await;
        let mut steady_lifecycle = lifecycle();
        let single = resolver(steady, policy)
            .resolve(&task(body), &mut steady_lifecycle)
            .await;

        assert_eq!(retried, single);
        assert_eq!(flaky.calls(), 2);
        assert_eq!(flaky_lifecycle.execution_attempts(), 2);

        let executed = flaky.executed.lock().unwrap();
        assert_eq!(executed[0], executed[1]);
    }

    #[tokio::test]
    async fn test_execution_retries_are_bounded() {
        let executor = ScriptedExecutor::new(vec![
            Err(TaskError::transient("pool timeout")),
            Err(TaskError::transient("pool timeout")),
            Err(TaskError::transient("pool timeout")),
            Ok(RawAggregate::Count(42)),
        ]);
        let resolver = resolver(executor.clone(), DisclosurePolicy::disabled());
        let mut lifecycle = lifecycle();

        let result = resolver
            .resolve(&task(diabetes_adults(serde_json::json!({"kind": "AVAILABILITY"}))), &mut lifecycle)
            .await;

        assert_eq!(result.error_code(), Some(ErrorCategory::ExecutionError));
        assert_eq!(executor.calls(), 3);
        assert_eq!(
            lifecycle.state(),
            TaskState::Failed(ErrorCategory::ExecutionError)
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let executor = ScriptedExecutor::new(vec![Err(TaskError::permanent("no such table"))]);
        let resolver = resolver(executor.clone(), DisclosurePolicy::disabled());
        let mut lifecycle = lifecycle();

        let result = resolver
            .resolve(&task(diabetes_adults(serde_json::json!({"kind": "AVAILABILITY"}))), &mut lifecycle)
            .await;

        assert_eq!(result.error_code(), Some(ErrorCategory::ExecutionError));
        assert_eq!(executor.calls(), 1);
    }

    #[test]
    fn test_safeguard_labels_buckets() {
        let resolver = resolver(ScriptedExecutor::new(vec![]), DisclosurePolicy::disabled());
        let payload = resolver
            .safeguard(
                RawAggregate::Buckets(vec![
                    ("40".to_string(), 7),
                    (UNKNOWN_BUCKET.to_string(), 2),
                ]),
                ResultShape::Buckets(Dimension::AgeBand { width: 10 }),
            )
            .unwrap();

        let Payload::Distribution(distribution) = payload else {
            panic!("expected a distribution");
        };
        assert_eq!(distribution.dimension, "AGE_BAND_10");
        assert_eq!(distribution.buckets["40-49"], Cell::Count(7));
        assert_eq!(distribution.buckets[UNKNOWN_BUCKET], Cell::Count(2));
    }

    #[test]
    fn test_safeguard_concept_labels() {
        let resolver = resolver(ScriptedExecutor::new(vec![]), DisclosurePolicy::disabled());
        let payload = resolver
            .safeguard(
                RawAggregate::Buckets(vec![("201820".to_string(), 11)]),
                ResultShape::Buckets(Dimension::Concept(FactDomain::Condition)),
            )
            .unwrap();
        let Payload::Distribution(distribution) = payload else {
            panic!("expected a distribution");
        };
        assert_eq!(distribution.buckets["OMOP:201820"], Cell::Count(11));
    }

    #[test]
    fn test_safeguard_shape_mismatch() {
        let resolver = resolver(ScriptedExecutor::new(vec![]), DisclosurePolicy::disabled());
        let err = resolver
            .safeguard(RawAggregate::Count(1), ResultShape::Buckets(Dimension::Sex))
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CompilationError);
    }
}
