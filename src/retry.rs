use std::time::Duration;

use rand::Rng;

use crate::error::TaskResult;
use crate::models::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct RetryConfig {
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(60),
      jitter: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  RetryNow,
  RetryAfter(Duration),
  GiveUp,
}

impl RetryDecision {
  pub fn delay(&self) -> Option<Duration> {
    match self {
      RetryDecision::RetryNow => Some(Duration::ZERO),
      RetryDecision::RetryAfter(delay) => Some(*delay),
      RetryDecision::GiveUp => None,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
  config: RetryConfig,
}

impl RetryPolicy {
  pub fn new(config: RetryConfig) -> Self {
    Self { config }
  }

  pub fn decide(&self, task: &Task) -> RetryDecision {
    if task.status != TaskStatus::Failed || task.retry_count >= task.max_retries {
      return RetryDecision::GiveUp;
    }
    let delay = self.backoff(task.retry_count);
    if delay.is_zero() {
      RetryDecision::RetryNow
    } else {
      RetryDecision::RetryAfter(delay)
    }
  }

  /// `min(base * 2^attempt, max)`, optionally spread by up to +/-50%.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let capped = self
      .config
      .base_delay
      .checked_mul(factor)
      .map_or(self.config.max_delay, |d| d.min(self.config.max_delay));
    if !self.config.jitter || capped.is_zero() {
      return capped;
    }
    let spread = rand::rng().random_range(0.5..=1.5);
    capped.mul_f64(spread).min(self.config.max_delay)
  }

  /// Decides and, on approval, commits FAILED -> PENDING on the task.
  pub fn apply(&self, task: &mut Task) -> TaskResult<RetryDecision> {
    let decision = self.decide(task);
    if decision != RetryDecision::GiveUp {
      task.update_status(TaskStatus::Pending)?;
    }
    Ok(decision)
  }
}
