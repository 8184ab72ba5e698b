use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::Instant;
use uuid::Uuid;

use taskplane::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use taskplane::dispatcher::{Dispatcher, DispatcherConfig, Outcome};
use taskplane::error::{TaskError, TaskResult};
use taskplane::events::{MemoryRecorder, TaskEvent};
use taskplane::messaging::{
  disposition, Disposition, InMemoryTransport, Revocation, TaskMessage, TaskTransport, WorkerCallback, DEFAULT_QUEUE,
  HIGH_PRIORITY_QUEUE,
};
use taskplane::models::{Task, TaskPriority, TaskStatus};
use taskplane::retry::RetryConfig;
use taskplane::store::{InMemoryTaskStore, TaskStore};
use taskplane::worker_scheduler::Revocations;

struct Plane {
  dispatcher: Arc<Dispatcher>,
  transport: Arc<InMemoryTransport>,
  events: Arc<MemoryRecorder>,
}

fn plane(config: DispatcherConfig, breaker: CircuitBreakerConfig) -> Plane {
  let events = Arc::new(MemoryRecorder::new());
  let transport = Arc::new(InMemoryTransport::new());
  let breakers = Arc::new(CircuitBreakerRegistry::with_recorder(breaker, events.clone()));
  let dispatcher = Dispatcher::new(
    config,
    Arc::new(InMemoryTaskStore::new()),
    transport.clone(),
    breakers,
    events.clone(),
  );
  Plane { dispatcher, transport, events }
}

fn backoff(base_ms: u64) -> DispatcherConfig {
  DispatcherConfig {
    retry: RetryConfig {
      base_delay: Duration::from_millis(base_ms),
      max_delay: Duration::from_secs(30),
      jitter: false,
    },
    ..Default::default()
  }
}

async fn wait_for_sends(transport: &InMemoryTransport, task_id: Uuid, count: usize) {
  for _ in 0..1_000 {
    if transport.sent_for(task_id).len() >= count {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("task {} was not sent {} times", task_id, count);
}

fn assert_invariants(task: &Task) {
  assert!(task.progress <= 100);
  assert_eq!(task.completed_at.is_some(), task.is_completed());
  assert!(task.retry_count <= task.max_retries);
  if matches!(task.status, TaskStatus::Running | TaskStatus::Success | TaskStatus::Failed) {
    assert!(task.started_at.is_some());
  }
}

#[tokio::test(start_paused = true)]
async fn urgent_task_succeeds_on_third_attempt() {
  let p = plane(backoff(100), CircuitBreakerConfig::default());
  let task = Task::new("ML Model Training", "ml_training")
    .with_priority(TaskPriority::Urgent)
    .with_max_retries(2);
  let receipt = p.dispatcher.submit(task).await.unwrap();
  let id = receipt.task_id;
  assert_eq!(receipt.queue, HIGH_PRIORITY_QUEUE);
  wait_for_sends(&p.transport, id, 1).await;

  for (attempt, expected_delay) in [(1usize, 100u64), (2, 200)] {
    p.dispatcher.on_start(id).await.unwrap();
    p.dispatcher.on_progress(id, 65).await.unwrap();
    let failed_at = Instant::now();
    let outcome = p.dispatcher.on_failure(id, "GPU out of memory").await.unwrap();
    assert_eq!(
      outcome,
      Outcome::RetryScheduled { retry_count: attempt as u32, delay: Duration::from_millis(expected_delay) }
    );

    let task = p.dispatcher.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress, 0);
    assert_invariants(&task);

    wait_for_sends(&p.transport, id, attempt + 1).await;
    assert!(failed_at.elapsed() >= Duration::from_millis(expected_delay));
  }

  p.dispatcher.on_start(id).await.unwrap();
  p.dispatcher.on_success(id, Some(json!({"accuracy": 0.93}))).await.unwrap();

  let task = p.dispatcher.task(id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Success);
  assert_eq!(task.retry_count, 2);
  assert_eq!(task.progress, 100);
  assert!(task.completed_at.is_some());
  assert!(task.error_message.is_none());
  assert_invariants(&task);

  let sends = p.transport.sent_for(id);
  assert_eq!(sends.len(), 3);
  assert!(sends.iter().all(|(queue, _)| queue == HIGH_PRIORITY_QUEUE));
  assert_eq!(sends.iter().map(|(_, m)| m.attempt).collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_fails_attempt_without_worker() {
  let mut config = backoff(1_000);
  config.dependencies.insert("charge".into(), "payments".into());
  let breaker = CircuitBreakerConfig { failure_threshold: 1, open_timeout: Duration::from_secs(600) };
  let p = plane(config, breaker);
  p.dispatcher.breakers().record_failure("payments");
  assert_eq!(p.dispatcher.breakers().state("payments"), CircuitState::Open);

  let task = Task::new("Charge customer", "charge").with_max_retries(1);
  let id = p.dispatcher.submit(task).await.unwrap().task_id;

  let task = p.dispatcher.task(id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Pending);
  assert_eq!(task.retry_count, 1);
  assert!(p.transport.sent_for(id).is_empty());
  assert_eq!(p.events.count(|e| matches!(e, TaskEvent::DependencyRejected { .. })), 1);
  assert!(p.events.events().iter().any(|e| matches!(
    e,
    TaskEvent::RetryScheduled { task_id, delay, .. } if *task_id == id && *delay == Duration::from_millis(1_000)
  )));

  tokio::time::sleep(Duration::from_millis(1_100)).await;
  for _ in 0..50 {
    tokio::task::yield_now().await;
  }
  let task = p.dispatcher.task(id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Failed);
  assert!(task.error_message.unwrap().contains("payments"));
  assert!(p.transport.sent_for(id).is_empty());
  assert_eq!(p.events.count(|e| matches!(e, TaskEvent::RetriesExhausted { .. })), 1);
}

#[tokio::test]
async fn worker_failures_trip_the_breaker_and_success_closes_it() {
  let mut config = backoff(100);
  config.dependencies.insert("charge".into(), "payments".into());
  let breaker = CircuitBreakerConfig { failure_threshold: 2, open_timeout: Duration::ZERO };
  let p = plane(config, breaker);

  for _ in 0..2 {
    let id = p.dispatcher.submit(Task::new("charge", "charge").with_max_retries(0)).await.unwrap().task_id;
    p.dispatcher.on_start(id).await.unwrap();
    p.dispatcher.on_failure(id, "gateway 502").await.unwrap();
  }
  assert_eq!(p.dispatcher.breakers().state("payments"), CircuitState::Open);

  let trial = p.dispatcher.submit(Task::new("charge", "charge")).await.unwrap().task_id;
  assert_eq!(p.transport.sent_for(trial).len(), 1);
  assert_eq!(p.dispatcher.breakers().state("payments"), CircuitState::HalfOpen);

  let blocked = p.dispatcher.submit(Task::new("charge", "charge")).await.unwrap().task_id;
  assert!(p.transport.sent_for(blocked).is_empty());

  p.dispatcher.on_start(trial).await.unwrap();
  p.dispatcher.on_success(trial, None).await.unwrap();
  assert_eq!(p.dispatcher.breakers().state("payments"), CircuitState::Closed);
  assert_eq!(
    p.events.count(|e| matches!(e, TaskEvent::BreakerStateChanged { to: CircuitState::Closed, .. })),
    1
  );
}

#[tokio::test(start_paused = true)]
async fn four_failures_exhaust_three_retries() {
  let p = plane(backoff(0), CircuitBreakerConfig::default());
  let id = p.dispatcher.submit(Task::new("Email Campaign Delivery", "email").with_max_retries(3)).await.unwrap().task_id;

  for attempt in 1..=4usize {
    wait_for_sends(&p.transport, id, attempt).await;
    p.dispatcher.on_start(id).await.unwrap();
    p.dispatcher.on_failure(id, "SMTP server connection timeout").await.unwrap();
  }

  tokio::time::sleep(Duration::from_millis(50)).await;
  let task = p.dispatcher.task(id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Failed);
  assert_eq!(task.retry_count, 3);
  assert_eq!(task.error_message.as_deref(), Some("SMTP server connection timeout"));
  assert_eq!(p.transport.sent_for(id).len(), 4);
  assert_invariants(&task);
}

#[tokio::test]
async fn late_success_after_cancel_is_discarded() {
  let p = plane(DispatcherConfig::default(), CircuitBreakerConfig::default());
  let id = p.dispatcher.submit(Task::new("Database Backup", "backup")).await.unwrap().task_id;
  p.dispatcher.handle_callback(WorkerCallback::Start { task_id: id }).await.unwrap();

  assert_eq!(p.dispatcher.cancel(id).await.unwrap(), Outcome::Applied(TaskStatus::Cancelled));
  let outcome = p
    .dispatcher
    .handle_callback(WorkerCallback::Success { task_id: id, result: None })
    .await
    .unwrap();
  assert_eq!(outcome, Outcome::Discarded(TaskStatus::Cancelled));

  let task = p.dispatcher.task(id).await.unwrap();
  assert_eq!(task.status, TaskStatus::Cancelled);
  assert_eq!(p.transport.revoked(), vec![id]);
  assert_invariants(&task);
}

#[tokio::test(start_paused = true)]
async fn scheduled_task_waits_for_its_time() {
  let p = plane(DispatcherConfig::default(), CircuitBreakerConfig::default());
  let at = chrono::Utc::now() + chrono::Duration::seconds(120);
  let task = Task::new("Weekly Report Generation", "report_generation").with_scheduled_at(at);
  let receipt = p.dispatcher.submit(task).await.unwrap();
  assert_eq!(receipt.queue, DEFAULT_QUEUE);

  tokio::time::sleep(Duration::from_secs(60)).await;
  assert!(p.transport.sent_for(receipt.task_id).is_empty());

  tokio::time::sleep(Duration::from_secs(61)).await;
  wait_for_sends(&p.transport, receipt.task_id, 1).await;
  let (_, message) = &p.transport.sent_for(receipt.task_id)[0];
  assert_eq!(message.not_before, Some(at));
}

/// Never completes a send or revoke for one task.
struct StalledTransport {
  stalled: Uuid,
  inner: InMemoryTransport,
}

#[async_trait]
impl TaskTransport for StalledTransport {
  async fn enqueue(&self, queue: &str, message: &TaskMessage, not_before: Option<DateTime<Utc>>) -> anyhow::Result<()> {
    if message.task_id == self.stalled {
      std::future::pending::<()>().await;
    }
    self.inner.enqueue(queue, message, not_before).await
  }

  async fn revoke(&self, task_id: Uuid, attempt: u32) -> anyhow::Result<()> {
    if task_id == self.stalled {
      std::future::pending::<()>().await;
    }
    self.inner.revoke(task_id, attempt).await
  }
}

async fn wait_for_status(dispatcher: &Dispatcher, task_id: Uuid, status: TaskStatus) {
  for _ in 0..1_000 {
    if dispatcher.task(task_id).await.is_ok_and(|t| t.status == status) {
      return;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
  }
  panic!("task {} never reached {}", task_id, status);
}

#[tokio::test]
async fn stalled_transport_does_not_hold_the_task_lock() {
  // 1 and 65 share a lock stripe.
  let stalled = Uuid::from_u128(1);
  let neighbour = Uuid::from_u128(65);
  let transport = Arc::new(StalledTransport { stalled, inner: InMemoryTransport::new() });
  let dispatcher = Dispatcher::new(
    DispatcherConfig::default(),
    Arc::new(InMemoryTaskStore::new()),
    transport.clone(),
    Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
    Arc::new(MemoryRecorder::new()),
  );

  let mut task = Task::new("neighbour", "email");
  task.id = neighbour;
  dispatcher.submit(task).await.unwrap();

  let mut task = Task::new("stalled", "email");
  task.id = stalled;
  let sending = {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move { dispatcher.submit(task).await })
  };
  wait_for_status(&dispatcher, stalled, TaskStatus::Pending).await;

  let started = tokio::time::timeout(Duration::from_secs(2), dispatcher.on_start(neighbour))
    .await
    .expect("on_start waited on another task's send");
  assert_eq!(started.unwrap(), Outcome::Applied(TaskStatus::Running));
  assert!(dispatcher.pending_timers().await >= 1);

  let cancelling = {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move { dispatcher.cancel(stalled).await })
  };
  wait_for_status(&dispatcher, stalled, TaskStatus::Cancelled).await;
  let progressed = tokio::time::timeout(Duration::from_secs(2), dispatcher.on_progress(neighbour, 50))
    .await
    .expect("on_progress waited on another task's revoke");
  assert_eq!(progressed.unwrap(), Outcome::Applied(TaskStatus::Running));

  assert!(!sending.is_finished());
  assert!(!cancelling.is_finished());
  sending.abort();
  cancelling.abort();
}

/// Fails the next `failures` updates with a storage error.
#[derive(Default)]
struct FlakyStore {
  inner: InMemoryTaskStore,
  failures: AtomicUsize,
}

#[async_trait]
impl TaskStore for FlakyStore {
  async fn save(&self, task: &Task) -> TaskResult<()> {
    self.inner.save(task).await
  }

  async fn load(&self, task_id: Uuid) -> TaskResult<Task> {
    self.inner.load(task_id).await
  }

  async fn update(&self, task: &Task) -> TaskResult<()> {
    let failing = self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(TaskError::Storage(sqlx::Error::PoolTimedOut));
    }
    self.inner.update(task).await
  }
}

#[tokio::test]
async fn success_report_survives_a_storage_error() {
  let store = Arc::new(FlakyStore::default());
  let dispatcher = Dispatcher::new(
    DispatcherConfig::default(),
    store.clone(),
    Arc::new(InMemoryTransport::new()),
    Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
    Arc::new(MemoryRecorder::new()),
  );
  let id = dispatcher.submit(Task::new("Weekly Report Generation", "report_generation")).await.unwrap().task_id;
  dispatcher.on_start(id).await.unwrap();

  store.failures.store(1, Ordering::SeqCst);
  let callback = WorkerCallback::Success { task_id: id, result: Some(json!({"pages": 12})) };
  let first = dispatcher.handle_callback(callback.clone()).await;
  assert!(matches!(first, Err(TaskError::Storage(_))));
  assert_eq!(disposition(&first), Disposition::Requeue);
  assert_eq!(dispatcher.task(id).await.unwrap().status, TaskStatus::Running);

  let redelivered = dispatcher.handle_callback(callback).await;
  assert_eq!(disposition(&redelivered), Disposition::Ack);
  assert_eq!(redelivered.unwrap(), Outcome::Applied(TaskStatus::Success));
  let task = dispatcher.task(id).await.unwrap();
  assert_eq!(task.result, Some(json!({"pages": 12})));
  assert_invariants(&task);
}

#[tokio::test(start_paused = true)]
async fn lost_dispatch_revokes_only_the_lost_attempt() {
  let config = DispatcherConfig { ack_timeout: Duration::from_secs(30), ..backoff(1_000) };
  let p = plane(config, CircuitBreakerConfig::default());
  let id = p.dispatcher.submit(Task::new("Database Backup", "backup")).await.unwrap().task_id;

  wait_for_sends(&p.transport, id, 1).await;
  tokio::time::sleep(Duration::from_secs(30)).await;
  wait_for_sends(&p.transport, id, 2).await;
  assert_eq!(p.transport.revocations(), vec![Revocation { task_id: id, attempt: 0 }]);

  let sends = p.transport.sent_for(id);
  let (lost, retried) = (&sends[0].1, &sends[1].1);
  assert_eq!(retried.attempt, 1);

  let worker_view = Revocations::default();
  for revocation in p.transport.revocations() {
    worker_view.revoke(revocation);
  }
  assert!(worker_view.should_skip(lost));
  assert!(!worker_view.should_skip(retried));
}
