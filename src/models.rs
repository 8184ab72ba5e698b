use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Upper bound on a task's retry budget.
pub const MAX_RETRIES_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  Pending,
  Running,
  Success,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Success | Self::Failed | Self::Cancelled)
  }

  /// Every edge of the lifecycle graph. FAILED -> PENDING is further gated by
  /// the task's retry budget in [`Task::update_status`].
  pub fn can_transition_to(&self, next: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
      (self, next),
      (Pending, Running)
        | (Pending, Cancelled)
        | (Running, Success)
        | (Running, Failed)
        | (Running, Cancelled)
        | (Failed, Pending)
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Success => "success",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "pending" => Ok(Self::Pending),
      "running" => Ok(Self::Running),
      "success" => Ok(Self::Success),
      "failed" => Ok(Self::Failed),
      "cancelled" => Ok(Self::Cancelled),
      other => Err(format!("Invalid task status: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
  Low,
  #[default]
  Normal,
  High,
  Urgent,
}

impl TaskPriority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Low => "low",
      Self::Normal => "normal",
      Self::High => "high",
      Self::Urgent => "urgent",
    }
  }

  /// Numeric weight used by workers to order local deliveries.
  pub fn weight(&self) -> u8 {
    match self {
      Self::Low => 1,
      Self::Normal => 5,
      Self::High => 8,
      Self::Urgent => 10,
    }
  }
}

impl fmt::Display for TaskPriority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskPriority {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "low" => Ok(Self::Low),
      "normal" => Ok(Self::Normal),
      "high" => Ok(Self::High),
      "urgent" => Ok(Self::Urgent),
      other => Err(format!("Invalid task priority: {}", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: Uuid,
  pub name: String,
  pub description: Option<String>,
  pub task_type: String,
  pub parameters: serde_json::Value,
  pub tags: BTreeSet<String>,
  pub created_by: String,
  pub priority: TaskPriority,
  pub scheduled_at: Option<DateTime<Utc>>,
  pub status: TaskStatus,
  pub progress: u8,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub error_message: Option<String>,
  pub result: Option<serde_json::Value>,
  pub retry_count: u32,
  pub max_retries: u32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      name: name.into(),
      description: None,
      task_type: task_type.into(),
      parameters: serde_json::Value::Object(Default::default()),
      tags: BTreeSet::new(),
      created_by: "system".into(),
      priority: TaskPriority::Normal,
      scheduled_at: None,
      status: TaskStatus::Pending,
      progress: 0,
      started_at: None,
      completed_at: None,
      error_message: None,
      result: None,
      retry_count: 0,
      max_retries: DEFAULT_MAX_RETRIES,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn with_priority(mut self, priority: TaskPriority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
    self.parameters = parameters;
    self
  }

  pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
    self.scheduled_at = Some(scheduled_at);
    self
  }

  pub fn can_retry(&self) -> bool {
    self.status == TaskStatus::Failed && self.retry_count < self.max_retries
  }

  pub fn is_completed(&self) -> bool {
    self.status.is_terminal()
  }

  pub fn is_active(&self) -> bool {
    matches!(self.status, TaskStatus::Pending | TaskStatus::Running)
  }

  /// Applies a lifecycle transition. On rejection the task is left untouched.
  pub fn update_status(&mut self, new_status: TaskStatus) -> TaskResult<()> {
    self.transition(new_status, None)
  }

  /// RUNNING -> FAILED, recording why the attempt failed.
  pub fn fail(&mut self, error: impl Into<String>) -> TaskResult<()> {
    self.transition(TaskStatus::Failed, Some(error.into()))
  }

  /// RUNNING -> SUCCESS, keeping the worker's result document.
  pub fn succeed(&mut self, result: Option<serde_json::Value>) -> TaskResult<()> {
    self.transition(TaskStatus::Success, None)?;
    self.result = result;
    Ok(())
  }

  fn transition(&mut self, new_status: TaskStatus, error: Option<String>) -> TaskResult<()> {
    let allowed = self.status.can_transition_to(new_status)
      && (new_status != TaskStatus::Pending || self.can_retry());
    if !allowed {
      return Err(TaskError::InvalidTransition {
        task_id: self.id,
        from: self.status,
        to: new_status,
      });
    }

    let now = Utc::now();
    match new_status {
      TaskStatus::Running => {
        if self.started_at.is_none() {
          self.started_at = Some(now);
        }
      }
      TaskStatus::Success => {
        self.progress = 100;
        self.completed_at = Some(now);
      }
      TaskStatus::Failed => {
        self.completed_at = Some(now);
        self.error_message = Some(error.unwrap_or_else(|| "task failed".into()));
      }
      TaskStatus::Cancelled => {
        self.completed_at = Some(now);
      }
      TaskStatus::Pending => {
        self.retry_count += 1;
        self.progress = 0;
        self.completed_at = None;
        self.error_message = None;
      }
    }
    self.status = new_status;
    self.updated_at = now;
    Ok(())
  }

  /// Records worker progress, clamped to [0, 100]. Status is never changed.
  /// Returns false when the task is already finished.
  pub fn set_progress(&mut self, percent: i64) -> bool {
    if !self.is_active() {
      return false;
    }
    self.progress = percent.clamp(0, 100) as u8;
    self.updated_at = Utc::now();
    true
  }
}
