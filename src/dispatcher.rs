//! Priority dispatcher: owns every task from admission to a terminal state.
//!
//! All mutations of one task happen under that task's lock stripe as a
//! load / transition / update sequence, so duplicated or racing worker
//! callbacks apply at most once. Delayed work (backoff, `scheduled_at`,
//! dispatch watchdogs) goes through the [`Timer`] and never blocks a caller.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::circuit_breaker::{Admission, CircuitBreakerRegistry};
use crate::error::{TaskError, TaskResult};
use crate::events::{EventRecorder, TaskEvent};
use crate::messaging::{DEFAULT_QUEUE, HIGH_PRIORITY_QUEUE, TaskMessage, TaskTransport, WorkerCallback};
use crate::models::{DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT, Task, TaskPriority, TaskStatus};
use crate::retry::{RetryConfig, RetryDecision, RetryPolicy};
use crate::store::TaskStore;
use crate::timer::{Timer, TimerAction};

const LOCK_STRIPES: usize = 64;

/// Clock skew tolerated on `scheduled_at` at submission.
pub const SCHEDULE_SKEW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
  pub priority_queues: HashMap<TaskPriority, String>,
  /// task_type -> monitored dependency name.
  pub dependencies: HashMap<String, String>,
  pub default_max_retries: u32,
  pub ack_timeout: Duration,
  pub execution_timeout: Duration,
  pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    let priority_queues = HashMap::from([
      (TaskPriority::Urgent, HIGH_PRIORITY_QUEUE.to_string()),
      (TaskPriority::High, HIGH_PRIORITY_QUEUE.to_string()),
      (TaskPriority::Normal, DEFAULT_QUEUE.to_string()),
      (TaskPriority::Low, DEFAULT_QUEUE.to_string()),
    ]);
    Self {
      priority_queues,
      dependencies: HashMap::new(),
      default_max_retries: DEFAULT_MAX_RETRIES,
      ack_timeout: Duration::from_secs(300),
      execution_timeout: Duration::from_secs(30 * 60),
      retry: RetryConfig::default(),
    }
  }
}

impl DispatcherConfig {
  pub fn queue_for(&self, priority: TaskPriority) -> &str {
    self
      .priority_queues
      .get(&priority)
      .map(String::as_str)
      .unwrap_or(DEFAULT_QUEUE)
  }

  pub fn dependency_for(&self, task_type: &str) -> Option<&str> {
    self.dependencies.get(task_type).map(String::as_str)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
  pub task_id: Uuid,
  pub queue: String,
}

/// A send prepared under the task lock and performed once it is released.
struct PendingSend {
  queue: String,
  message: TaskMessage,
}

/// What a callback or command did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Applied(TaskStatus),
  RetryScheduled { retry_count: u32, delay: Duration },
  /// Not valid against the current state; nothing changed.
  Discarded(TaskStatus),
}

pub struct Dispatcher {
  config: DispatcherConfig,
  store: Arc<dyn TaskStore>,
  transport: Arc<dyn TaskTransport>,
  breakers: Arc<CircuitBreakerRegistry>,
  retry: RetryPolicy,
  events: Arc<dyn EventRecorder>,
  timer: Arc<Timer>,
  locks: Vec<Mutex<()>>,
  probes: DashMap<Uuid, (String, u64)>,
}

impl Dispatcher {
  /// Builds the dispatcher and starts its timer loop on the current runtime.
  pub fn new(
    config: DispatcherConfig,
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn TaskTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<dyn EventRecorder>,
  ) -> Arc<Self> {
    let retry = RetryPolicy::new(config.retry.clone());
    let dispatcher = Arc::new(Self {
      config,
      store,
      transport,
      breakers,
      retry,
      events,
      timer: Arc::new(Timer::new()),
      locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
      probes: DashMap::new(),
    });
    Self::spawn_timer_loop(&dispatcher);
    dispatcher
  }

  fn spawn_timer_loop(dispatcher: &Arc<Self>) -> JoinHandle<()> {
    let timer = dispatcher.timer.clone();
    let weak: Weak<Self> = Arc::downgrade(dispatcher);
    tokio::spawn(async move {
      loop {
        let action = timer.next_due().await;
        let Some(dispatcher) = weak.upgrade() else {
          break;
        };
        tokio::spawn(async move {
          if let Err(e) = dispatcher.fire(action).await {
            error!(action = ?action, "Timer action failed: {}", e);
          }
        });
      }
    })
  }

  pub fn config(&self) -> &DispatcherConfig {
    &self.config
  }

  pub fn breakers(&self) -> &CircuitBreakerRegistry {
    &self.breakers
  }

  pub async fn task(&self, task_id: Uuid) -> TaskResult<Task> {
    self.store.load(task_id).await
  }

  fn lock_for(&self, task_id: Uuid) -> &Mutex<()> {
    &self.locks[(task_id.as_u128() % LOCK_STRIPES as u128) as usize]
  }

  fn transitioned(&self, task: &Task, from: TaskStatus) {
    self.events.record(TaskEvent::Transitioned { task_id: task.id, from, to: task.status });
  }

  fn rejected(&self, task: &Task, to: TaskStatus) -> Outcome {
    self.events.record(TaskEvent::TransitionRejected { task_id: task.id, from: task.status, to });
    Outcome::Discarded(task.status)
  }

  pub fn validate(&self, task: &Task) -> TaskResult<()> {
    if task.name.trim().is_empty() {
      return Err(TaskError::Validation("name must not be empty".into()));
    }
    if task.task_type.trim().is_empty() {
      return Err(TaskError::Validation("task_type must not be empty".into()));
    }
    if task.status != TaskStatus::Pending || task.retry_count != 0 || task.started_at.is_some() {
      return Err(TaskError::Validation("a new task must be pending with no attempts".into()));
    }
    if task.max_retries > MAX_RETRIES_LIMIT {
      return Err(TaskError::Validation(format!(
        "max_retries {} exceeds the limit of {}",
        task.max_retries, MAX_RETRIES_LIMIT
      )));
    }
    if task.progress > 100 {
      return Err(TaskError::Validation(format!("progress {} is out of range", task.progress)));
    }
    if let Some(at) = task.scheduled_at {
      if at < Utc::now() - chrono::Duration::seconds(SCHEDULE_SKEW.as_secs() as i64) {
        return Err(TaskError::Validation(format!("scheduled_at {} is in the past", at)));
      }
    }
    Ok(())
  }

  /// Persists a new task as PENDING and hands it to the queue for its
  /// priority, deferring the send until `scheduled_at` when that is ahead.
  pub async fn submit(&self, mut task: Task) -> TaskResult<SubmitReceipt> {
    self.validate(&task)?;
    let queue = self.config.queue_for(task.priority).to_string();
    let pending = {
      let _guard = self.lock_for(task.id).lock().await;
      self.store.save(&task).await?;
      self.events.record(TaskEvent::Submitted { task_id: task.id, queue: queue.clone(), priority: task.priority });

      let wait = task
        .scheduled_at
        .and_then(|at| (at - Utc::now()).to_std().ok())
        .filter(|d| !d.is_zero());
      match wait {
        Some(wait) => {
          debug!(task_id = %task.id, wait_ms = wait.as_millis() as u64, "Deferring scheduled task");
          self
            .timer
            .schedule(Instant::now() + wait, TimerAction::Enqueue { task_id: task.id, attempt: 0 })
            .await;
          None
        }
        None => self.dispatch_locked(&mut task).await?,
      }
    };
    if let Some(pending) = pending {
      self.send(pending).await;
    }
    Ok(SubmitReceipt { task_id: task.id, queue })
  }

  /// Prepares the current attempt for a worker and arms its ack deadline, or
  /// fails it fast when the task's dependency is unavailable. Caller holds
  /// the task lock and performs the returned send after releasing it.
  async fn dispatch_locked(&self, task: &mut Task) -> TaskResult<Option<PendingSend>> {
    if let Some(dependency) = self.config.dependency_for(&task.task_type) {
      match self.breakers.admit(dependency) {
        None => {
          self.events.record(TaskEvent::DependencyRejected {
            task_id: task.id,
            dependency: dependency.to_string(),
          });
          let reason = TaskError::DependencyUnavailable { dependency: dependency.to_string() }.to_string();
          self.fail_without_worker(task, reason).await?;
          return Ok(None);
        }
        Some(Admission::Probe { epoch }) => {
          self.probes.insert(task.id, (dependency.to_string(), epoch));
        }
        Some(Admission::Closed) => {}
      }
    }

    self
      .timer
      .schedule(
        Instant::now() + self.config.ack_timeout,
        TimerAction::AckDeadline { task_id: task.id, attempt: task.retry_count },
      )
      .await;
    Ok(Some(PendingSend {
      queue: self.config.queue_for(task.priority).to_string(),
      message: TaskMessage::for_attempt(task),
    }))
  }

  async fn send(&self, pending: PendingSend) {
    let PendingSend { queue, message } = pending;
    match self.transport.enqueue(&queue, &message, message.not_before).await {
      Ok(()) => info!(task_id = %message.task_id, queue = %queue, attempt = message.attempt, "Task enqueued"),
      // The ack deadline turns a lost send into a failed attempt.
      Err(e) => error!(task_id = %message.task_id, queue = %queue, "Failed to enqueue task: {:?}", e),
    }
  }

  async fn revoke(&self, task_id: Uuid, attempt: u32) {
    if let Err(e) = self.transport.revoke(task_id, attempt).await {
      error!(task_id = %task_id, attempt, "Failed to revoke task: {:?}", e);
    }
  }

  /// Fails an attempt no worker ran. Goes through PENDING -> RUNNING -> FAILED
  /// so the lifecycle graph stays closed, then applies the retry policy.
  async fn fail_without_worker(&self, task: &mut Task, reason: String) -> TaskResult<Outcome> {
    task.update_status(TaskStatus::Running)?;
    self.transitioned(task, TaskStatus::Pending);
    task.fail(reason)?;
    self.transitioned(task, TaskStatus::Running);
    self.store.update(task).await?;
    self.retry_locked(task).await
  }

  /// Caller holds the lock and `task` is FAILED and already stored.
  async fn retry_locked(&self, task: &mut Task) -> TaskResult<Outcome> {
    match self.retry.decide(task) {
      RetryDecision::GiveUp => {
        self.events.record(TaskEvent::RetriesExhausted { task_id: task.id, attempts: task.retry_count + 1 });
        Ok(Outcome::Applied(TaskStatus::Failed))
      }
      decision => {
        let delay = decision.delay().unwrap_or_default();
        task.update_status(TaskStatus::Pending)?;
        self.store.update(task).await?;
        self.transitioned(task, TaskStatus::Failed);
        self.events.record(TaskEvent::RetryScheduled { task_id: task.id, retry_count: task.retry_count, delay });
        self
          .timer
          .schedule(
            Instant::now() + delay,
            TimerAction::Enqueue { task_id: task.id, attempt: task.retry_count },
          )
          .await;
        Ok(Outcome::RetryScheduled { retry_count: task.retry_count, delay })
      }
    }
  }

  /// Reports a worker outcome to the breaker guarding the task's dependency.
  fn settle_dependency(&self, task: &Task, succeeded: bool) {
    self.probes.remove(&task.id);
    if let Some(dependency) = self.config.dependency_for(&task.task_type) {
      if succeeded {
        self.breakers.record_success(dependency);
      } else {
        self.breakers.record_failure(dependency);
      }
    }
  }

  fn release_probe(&self, task_id: Uuid) {
    if let Some((_, (dependency, epoch))) = self.probes.remove(&task_id) {
      self.breakers.release_probe(&dependency, epoch);
    }
  }

  pub async fn handle_callback(&self, callback: WorkerCallback) -> TaskResult<Outcome> {
    match callback {
      WorkerCallback::Start { task_id } => self.on_start(task_id).await,
      WorkerCallback::Progress { task_id, percent } => self.on_progress(task_id, percent).await,
      WorkerCallback::Success { task_id, result } => self.on_success(task_id, result).await,
      WorkerCallback::Failure { task_id, error } => self.on_failure(task_id, error).await,
    }
  }

  pub async fn on_start(&self, task_id: Uuid) -> TaskResult<Outcome> {
    let _guard = self.lock_for(task_id).lock().await;
    let mut task = self.store.load(task_id).await?;
    if task.update_status(TaskStatus::Running).is_err() {
      return Ok(self.rejected(&task, TaskStatus::Running));
    }
    self.store.update(&task).await?;
    self.transitioned(&task, TaskStatus::Pending);
    self
      .timer
      .schedule(
        Instant::now() + self.config.execution_timeout,
        TimerAction::ExecutionDeadline { task_id, attempt: task.retry_count },
      )
      .await;
    Ok(Outcome::Applied(TaskStatus::Running))
  }

  pub async fn on_progress(&self, task_id: Uuid, percent: i64) -> TaskResult<Outcome> {
    let _guard = self.lock_for(task_id).lock().await;
    let mut task = self.store.load(task_id).await?;
    if !task.set_progress(percent) {
      debug!(task_id = %task_id, status = %task.status, "Ignoring progress for finished task");
      return Ok(Outcome::Discarded(task.status));
    }
    self.store.update(&task).await?;
    Ok(Outcome::Applied(task.status))
  }

  pub async fn on_success(&self, task_id: Uuid, result: Option<serde_json::Value>) -> TaskResult<Outcome> {
    let _guard = self.lock_for(task_id).lock().await;
    let mut task = self.store.load(task_id).await?;
    if task.succeed(result).is_err() {
      return Ok(self.rejected(&task, TaskStatus::Success));
    }
    self.store.update(&task).await?;
    self.transitioned(&task, TaskStatus::Running);
    self.settle_dependency(&task, true);
    Ok(Outcome::Applied(TaskStatus::Success))
  }

  pub async fn on_failure(&self, task_id: Uuid, error: impl Into<String>) -> TaskResult<Outcome> {
    let _guard = self.lock_for(task_id).lock().await;
    let mut task = self.store.load(task_id).await?;
    self.fail_running_locked(&mut task, error.into()).await
  }

  async fn fail_running_locked(&self, task: &mut Task, error: String) -> TaskResult<Outcome> {
    if task.fail(error).is_err() {
      return Ok(self.rejected(task, TaskStatus::Failed));
    }
    self.store.update(task).await?;
    self.transitioned(task, TaskStatus::Running);
    self.settle_dependency(task, false);
    self.retry_locked(task).await
  }

  /// Cancels a PENDING or RUNNING task and asks the transport to revoke the
  /// in-flight attempt. Outcomes reported later for it are discarded.
  pub async fn cancel(&self, task_id: Uuid) -> TaskResult<Outcome> {
    let attempt = {
      let _guard = self.lock_for(task_id).lock().await;
      let mut task = self.store.load(task_id).await?;
      let from = task.status;
      if task.update_status(TaskStatus::Cancelled).is_err() {
        return Ok(self.rejected(&task, TaskStatus::Cancelled));
      }
      self.store.update(&task).await?;
      self.transitioned(&task, from);
      self.release_probe(task_id);
      task.retry_count
    };
    self.revoke(task_id, attempt).await;
    Ok(Outcome::Applied(TaskStatus::Cancelled))
  }

  /// Transport calls are made after the task lock is released.
  async fn fire(&self, action: TimerAction) -> TaskResult<()> {
    match action {
      TimerAction::Enqueue { task_id, attempt } => {
        let pending = {
          let _guard = self.lock_for(task_id).lock().await;
          let mut task = self.store.load(task_id).await?;
          if task.status != TaskStatus::Pending || task.retry_count != attempt {
            debug!(task_id = %task_id, attempt, status = %task.status, "Dropping stale enqueue");
            return Ok(());
          }
          self.dispatch_locked(&mut task).await?
        };
        if let Some(pending) = pending {
          self.send(pending).await;
        }
      }
      TimerAction::AckDeadline { task_id, attempt } => {
        {
          let _guard = self.lock_for(task_id).lock().await;
          let mut task = self.store.load(task_id).await?;
          if task.status != TaskStatus::Pending || task.retry_count != attempt {
            return Ok(());
          }
          let reason = format!("dispatch not acknowledged within {}s", self.config.ack_timeout.as_secs());
          self.events.record(TaskEvent::DispatchLost { task_id, reason: reason.clone() });
          self.release_probe(task_id);
          self.fail_without_worker(&mut task, reason).await?;
        }
        self.revoke(task_id, attempt).await;
      }
      TimerAction::ExecutionDeadline { task_id, attempt } => {
        {
          let _guard = self.lock_for(task_id).lock().await;
          let mut task = self.store.load(task_id).await?;
          if task.status != TaskStatus::Running || task.retry_count != attempt {
            return Ok(());
          }
          let reason = format!("execution time limit of {}s exceeded", self.config.execution_timeout.as_secs());
          self.fail_running_locked(&mut task, reason).await?;
        }
        self.revoke(task_id, attempt).await;
      }
    }
    Ok(())
  }

  pub async fn pending_timers(&self) -> usize {
    self.timer.pending().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
  use crate::events::MemoryRecorder;
  use crate::messaging::InMemoryTransport;
  use crate::store::InMemoryTaskStore;
  use serde_json::json;

  struct Harness {
    dispatcher: Arc<Dispatcher>,
    transport: Arc<InMemoryTransport>,
    events: Arc<MemoryRecorder>,
  }

  fn harness(config: DispatcherConfig, breaker: CircuitBreakerConfig) -> Harness {
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
    Harness { dispatcher, transport, events }
  }

  fn fixed_retry(base_ms: u64) -> DispatcherConfig {
    DispatcherConfig {
      retry: RetryConfig {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_secs(10),
        jitter: false,
      },
      ..Default::default()
    }
  }

  #[test]
  fn default_queue_mapping() {
    let config = DispatcherConfig::default();
    assert_eq!(config.queue_for(TaskPriority::Urgent), HIGH_PRIORITY_QUEUE);
    assert_eq!(config.queue_for(TaskPriority::High), HIGH_PRIORITY_QUEUE);
    assert_eq!(config.queue_for(TaskPriority::Normal), DEFAULT_QUEUE);
    assert_eq!(config.queue_for(TaskPriority::Low), DEFAULT_QUEUE);
  }

  #[tokio::test]
  async fn submit_rejects_malformed_tasks() {
    let h = harness(DispatcherConfig::default(), CircuitBreakerConfig::default());

    let past = Task::new("late", "email").with_scheduled_at(Utc::now() - chrono::Duration::minutes(5));
    assert!(matches!(h.dispatcher.submit(past).await, Err(TaskError::Validation(_))));

    let unnamed = Task::new("  ", "email");
    assert!(matches!(h.dispatcher.submit(unnamed).await, Err(TaskError::Validation(_))));

    let greedy = Task::new("greedy", "email").with_max_retries(MAX_RETRIES_LIMIT + 1);
    assert!(matches!(h.dispatcher.submit(greedy).await, Err(TaskError::Validation(_))));
    let bounded = Task::new("bounded", "email").with_max_retries(MAX_RETRIES_LIMIT);
    assert!(h.dispatcher.validate(&bounded).is_ok());

    let mut started = Task::new("started", "email");
    started.update_status(TaskStatus::Running).unwrap();
    assert!(matches!(h.dispatcher.submit(started).await, Err(TaskError::Validation(_))));
    assert!(h.transport.sent().is_empty());
  }

  #[tokio::test]
  async fn low_priority_goes_to_default_queue() {
    let h = harness(DispatcherConfig::default(), CircuitBreakerConfig::default());
    let task = Task::new("backup", "backup").with_priority(TaskPriority::Low);
    let receipt = h.dispatcher.submit(task).await.unwrap();
    assert_eq!(receipt.queue, DEFAULT_QUEUE);

    let sent = h.transport.sent_for(receipt.task_id);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, DEFAULT_QUEUE);
    assert_eq!(sent[0].1.attempt, 0);
  }

  #[tokio::test]
  async fn duplicate_success_is_a_noop() {
    let h = harness(DispatcherConfig::default(), CircuitBreakerConfig::default());
    let id = h.dispatcher.submit(Task::new("t", "email")).await.unwrap().task_id;
    h.dispatcher.on_start(id).await.unwrap();
    assert_eq!(
      h.dispatcher.on_success(id, Some(json!({"sent": true}))).await.unwrap(),
      Outcome::Applied(TaskStatus::Success)
    );
    let first = h.dispatcher.task(id).await.unwrap();

    assert_eq!(h.dispatcher.on_success(id, None).await.unwrap(), Outcome::Discarded(TaskStatus::Success));
    assert_eq!(h.dispatcher.on_failure(id, "late").await.unwrap(), Outcome::Discarded(TaskStatus::Success));
    let second = h.dispatcher.task(id).await.unwrap();
    assert_eq!(first.started_at, second.started_at);
    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(second.result, Some(json!({"sent": true})));
    assert_eq!(h.events.count(|e| matches!(e, TaskEvent::TransitionRejected { .. })), 2);
  }

  #[tokio::test]
  async fn racing_success_and_failure_apply_once() {
    let h = harness(fixed_retry(10), CircuitBreakerConfig::default());
    let id = h.dispatcher.submit(Task::new("t", "email")).await.unwrap().task_id;
    h.dispatcher.on_start(id).await.unwrap();

    let a = {
      let d = h.dispatcher.clone();
      tokio::spawn(async move { d.on_success(id, None).await })
    };
    let b = {
      let d = h.dispatcher.clone();
      tokio::spawn(async move { d.on_failure(id, "boom").await })
    };
    let outcomes = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
    let discarded = outcomes.iter().filter(|o| matches!(o, Outcome::Discarded(_))).count();
    assert_eq!(discarded, 1);
  }

  #[tokio::test]
  async fn progress_is_clamped_and_keeps_status() {
    let h = harness(DispatcherConfig::default(), CircuitBreakerConfig::default());
    let id = h.dispatcher.submit(Task::new("t", "video")).await.unwrap().task_id;
    h.dispatcher.on_start(id).await.unwrap();
    h.dispatcher.on_progress(id, 250).await.unwrap();
    let task = h.dispatcher.task(id).await.unwrap();
    assert_eq!(task.progress, 100);
    assert_eq!(task.status, TaskStatus::Running);
  }

  #[tokio::test]
  async fn cancel_only_while_active() {
    let h = harness(DispatcherConfig::default(), CircuitBreakerConfig::default());
    let id = h.dispatcher.submit(Task::new("t", "email")).await.unwrap().task_id;
    assert_eq!(h.dispatcher.cancel(id).await.unwrap(), Outcome::Applied(TaskStatus::Cancelled));
    assert_eq!(h.dispatcher.cancel(id).await.unwrap(), Outcome::Discarded(TaskStatus::Cancelled));
    assert_eq!(h.transport.revoked(), vec![id]);
    assert!(matches!(h.dispatcher.cancel(Uuid::new_v4()).await, Err(TaskError::NotFound(_))));
  }

  #[tokio::test(start_paused = true)]
  async fn unacknowledged_dispatch_becomes_a_failed_attempt() {
    let config = DispatcherConfig { ack_timeout: Duration::from_secs(30), ..fixed_retry(1_000) };
    let h = harness(config, CircuitBreakerConfig::default());
    let id = h.dispatcher.submit(Task::new("t", "email")).await.unwrap().task_id;

    tokio::time::sleep(Duration::from_secs(31)).await;
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
    let task = h.dispatcher.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert_eq!(h.events.count(|e| matches!(e, TaskEvent::DispatchLost { .. })), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn stuck_execution_hits_time_limit() {
    let config = DispatcherConfig { execution_timeout: Duration::from_secs(60), ..fixed_retry(1_000) };
    let h = harness(config, CircuitBreakerConfig::default());
    let id = h.dispatcher.submit(Task::new("t", "email").with_max_retries(0)).await.unwrap().task_id;
    h.dispatcher.on_start(id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    for _ in 0..20 {
      tokio::task::yield_now().await;
    }
    let task = h.dispatcher.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("time limit"));
  }

  #[tokio::test]
  async fn cancelled_probe_frees_breaker() {
    let mut config = DispatcherConfig::default();
    config.dependencies.insert("charge".into(), "payments".into());
    let breaker = CircuitBreakerConfig { failure_threshold: 1, open_timeout: Duration::ZERO };
    let h = harness(config, breaker);
    h.dispatcher.breakers().record_failure("payments");

    let id = h.dispatcher.submit(Task::new("probe", "charge")).await.unwrap().task_id;
    assert!(h.dispatcher.breakers().snapshot("payments").probe_in_flight);
    assert!(!h.dispatcher.breakers().allow("payments"));

    h.dispatcher.cancel(id).await.unwrap();
    assert_eq!(h.dispatcher.breakers().state("payments"), CircuitState::HalfOpen);
    assert!(h.dispatcher.breakers().allow("payments"));
  }
}
