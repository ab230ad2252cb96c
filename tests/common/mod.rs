//! In-memory collaborators for daemon tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally::adapters::broker::{Delivery, Receipt, TaskChannel};
use tally::adapters::database::{QueryExecutor, RawAggregate};
use tally::core::compiler::{CompiledQuery, SqlCompiler};
use tally::core::daemon::{DaemonSettings, RetryPolicy};
use tally::core::disclosure::DisclosurePolicy;
use tally::core::resolver::Resolver;
use tally::domain::errors::TaskError;
use tally::domain::ids::CollectionId;
use tally::domain::outcome::TaskResult;
use tally::domain::query::QueryLimits;
use tally::domain::TallyError;

/// Channel event, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Published(String),
    Acknowledged(String),
}

/// Task channel backed by a queue
#[derive(Default)]
pub struct FakeChannel {
    inbox: Mutex<VecDeque<Delivery>>,
    receive_errors: AtomicU32,
    publish_failures: AtomicU32,
    publish_calls: AtomicU32,
    published: Mutex<Vec<TaskResult>>,
    events: Mutex<Vec<Event>>,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a delivery with receipt `r-<n>`
    pub fn push(&self, payload: serde_json::Value) {
        let mut inbox = self.inbox.lock().unwrap();
        let receipt = Receipt::new(format!("r-{}", inbox.len() + 1));
        inbox.push_back(Delivery {
            receipt,
            payload: serde_json::to_vec(&payload).unwrap(),
        });
    }

    pub fn push_raw(&self, receipt: &str, payload: &[u8]) {
        self.inbox.lock().unwrap().push_back(Delivery {
            receipt: Receipt::new(receipt),
            payload: payload.to_vec(),
        });
    }

    /// The next `n` receives fail
    pub fn fail_receives(&self, n: u32) {
        self.receive_errors.store(n, Ordering::SeqCst);
    }

    /// The next `n` publishes fail
    pub fn fail_publishes(&self, n: u32) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<TaskResult> {
        self.published.lock().unwrap().clone()
    }

    pub fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn acknowledged(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Acknowledged(_)))
            .count()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl TaskChannel for FakeChannel {
    async fn receive(&self) -> tally::domain::Result<Option<Delivery>> {
        if take_one(&self.receive_errors) {
            return Err(TallyError::Broker("connection refused".to_string()));
        }
        Ok(self.inbox.lock().unwrap().pop_front())
    }

    async fn publish(&self, result: &TaskResult) -> Result<(), TaskError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.publish_failures) {
            return Err(TaskError::Publish("503 Service Unavailable".to_string()));
        }
        self.published.lock().unwrap().push(result.clone());
        self.events
            .lock()
            .unwrap()
            .push(Event::Published(result.correlation_id.to_string()));
        Ok(())
    }

    async fn acknowledge(&self, receipt: &Receipt) -> tally::domain::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Acknowledged(receipt.to_string()));
        Ok(())
    }
}

/// Executor returning a fixed aggregate, optionally slow or flaky
pub struct FakeExecutor {
    response: RawAggregate,
    delay: Duration,
    transient_failures: AtomicU32,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(response: RawAggregate) -> Self {
        Self {
            response,
            delay: Duration::ZERO,
            transient_failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, _query: &CompiledQuery) -> Result<RawAggregate, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if take_one(&self.transient_failures) {
            return Err(TaskError::transient("connection reset by peer"));
        }
        Ok(self.response.clone())
    }

    async fn test_connection(&self) -> tally::domain::Result<()> {
        Ok(())
    }
}

pub fn resolver(executor: Arc<FakeExecutor>, policy: DisclosurePolicy) -> Arc<Resolver> {
    Arc::new(Resolver::new(
        SqlCompiler::new("cdm").unwrap(),
        executor,
        policy,
        QueryLimits::default(),
    ))
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
    }
}

pub fn settings(concurrency: usize) -> DaemonSettings {
    DaemonSettings {
        concurrency,
        task_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(5),
        execution_retry: fast_policy(3),
        publish_retry: fast_policy(3),
        polling_interval: Duration::from_millis(5),
        receive_backoff: RetryPolicy::unbounded(Duration::from_millis(1), Duration::from_millis(10)),
        default_reply_to: CollectionId::new("RQ-HOME").unwrap(),
    }
}

/// Polls `condition` until it holds, panicking after five seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Task message for the diabetes-in-adults cohort
pub fn diabetes_adults(correlation_id: &str, output: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "correlation_id": correlation_id,
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
