use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitState;
use crate::models::{TaskPriority, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
  Submitted { task_id: Uuid, queue: String, priority: TaskPriority },
  Transitioned { task_id: Uuid, from: TaskStatus, to: TaskStatus },
  TransitionRejected { task_id: Uuid, from: TaskStatus, to: TaskStatus },
  RetryScheduled { task_id: Uuid, retry_count: u32, delay: Duration },
  RetriesExhausted { task_id: Uuid, attempts: u32 },
  BreakerStateChanged { dependency: String, from: CircuitState, to: CircuitState },
  DependencyRejected { task_id: Uuid, dependency: String },
  RateLimited { caller: String, retry_after: Duration },
  DispatchLost { task_id: Uuid, reason: String },
}

/// Sink for the named events the control plane emits. Formatting and export
/// are left to the implementation.
pub trait EventRecorder: Send + Sync {
  fn record(&self, event: TaskEvent);
}

#[derive(Debug, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
  fn record(&self, event: TaskEvent) {
    match &event {
      TaskEvent::Submitted { task_id, queue, priority } => {
        info!(task_id = %task_id, queue = %queue, priority = %priority, "Task submitted");
      }
      TaskEvent::Transitioned { task_id, from, to } => {
        info!(task_id = %task_id, from = %from, to = %to, "Task transitioned");
      }
      TaskEvent::TransitionRejected { task_id, from, to } => {
        warn!(task_id = %task_id, from = %from, to = %to, "Transition rejected");
      }
      TaskEvent::RetryScheduled { task_id, retry_count, delay } => {
        info!(task_id = %task_id, retry_count, delay_ms = delay.as_millis() as u64, "Retry scheduled");
      }
      TaskEvent::RetriesExhausted { task_id, attempts } => {
        warn!(task_id = %task_id, attempts, "Retries exhausted, task failed permanently");
      }
      TaskEvent::BreakerStateChanged { dependency, from, to } => {
        warn!(dependency = %dependency, from = ?from, to = ?to, "Circuit breaker state changed");
      }
      TaskEvent::DependencyRejected { task_id, dependency } => {
        warn!(task_id = %task_id, dependency = %dependency, "Dependency unavailable, attempt failed fast");
      }
      TaskEvent::RateLimited { caller, retry_after } => {
        warn!(caller = %caller, retry_after_secs = retry_after.as_secs(), "Rate limit exceeded");
      }
      TaskEvent::DispatchLost { task_id, reason } => {
        warn!(task_id = %task_id, reason = %reason, "Dispatch lost");
      }
    }
  }
}

/// Keeps every event in memory; used by tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
  events: Mutex<Vec<TaskEvent>>,
}

impl MemoryRecorder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<TaskEvent> {
    self.events.lock().clone()
  }

  pub fn count(&self, predicate: impl Fn(&TaskEvent) -> bool) -> usize {
    self.events.lock().iter().filter(|e| predicate(e)).count()
  }
}

impl EventRecorder for MemoryRecorder {
  fn record(&self, event: TaskEvent) {
    self.events.lock().push(event);
  }
}
