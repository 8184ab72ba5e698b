use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("invalid transition for task {task_id}: {from} -> {to}")]
  InvalidTransition { task_id: Uuid, from: TaskStatus, to: TaskStatus },

  #[error("validation failed: {0}")]
  Validation(String),

  #[error("rate limit exceeded, retry after {}s", retry_after.as_secs())]
  RateLimited { retry_after: Duration },

  #[error("dependency '{dependency}' is unavailable")]
  DependencyUnavailable { dependency: String },

  #[error("task {task_id} exhausted its retries after {attempts} attempts")]
  RetriesExhausted { task_id: Uuid, attempts: u32 },

  #[error("task {0} not found")]
  NotFound(Uuid),

  #[error("storage error: {0}")]
  Storage(#[from] sqlx::Error),

  #[error("transport error: {0}")]
  Transport(#[from] anyhow::Error),
}

impl TaskError {
  /// Rejections are answers to the caller, not faults of the system.
  pub fn is_rejection(&self) -> bool {
    matches!(
      self,
      TaskError::InvalidTransition { .. }
        | TaskError::Validation(_)
        | TaskError::RateLimited { .. }
        | TaskError::DependencyUnavailable { .. }
        | TaskError::RetriesExhausted { .. }
    )
  }

  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      TaskError::RateLimited { retry_after } => Some(*retry_after),
      _ => None,
    }
  }
}
