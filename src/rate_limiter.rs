use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::events::{EventRecorder, TaskEvent, TracingRecorder};

pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
  pub limit_per_minute: u32,
}

impl Default for RateLimiterConfig {
  fn default() -> Self {
    Self { limit_per_minute: 60 }
  }
}

#[derive(Debug, Clone, Copy)]
struct Window {
  start: Instant,
  count: u32,
}

/// Fixed one-minute window per caller key.
pub struct RateLimiter {
  config: RateLimiterConfig,
  windows: DashMap<String, Window>,
  events: Arc<dyn EventRecorder>,
}

impl RateLimiter {
  pub fn new(config: RateLimiterConfig) -> Self {
    Self::with_recorder(config, Arc::new(TracingRecorder))
  }

  pub fn with_recorder(config: RateLimiterConfig, events: Arc<dyn EventRecorder>) -> Self {
    Self {
      config,
      windows: DashMap::new(),
      events,
    }
  }

  pub fn try_acquire(&self, caller_key: &str) -> TaskResult<()> {
    self.try_acquire_at(caller_key, Instant::now())
  }

  pub fn try_acquire_at(&self, caller_key: &str, now: Instant) -> TaskResult<()> {
    let outcome = {
      let mut window = self
        .windows
        .entry(caller_key.to_string())
        .or_insert(Window { start: now, count: 0 });
      if now.saturating_duration_since(window.start) >= WINDOW {
        window.start = now;
        window.count = 0;
      }
      if window.count < self.config.limit_per_minute {
        window.count += 1;
        Ok(window.count)
      } else {
        Err(WINDOW.saturating_sub(now.saturating_duration_since(window.start)))
      }
    };

    match outcome {
      Ok(count) => {
        debug!(caller = %caller_key, count, "Request admitted");
        Ok(())
      }
      Err(retry_after) => {
        self.events.record(TaskEvent::RateLimited {
          caller: caller_key.to_string(),
          retry_after,
        });
        Err(TaskError::RateLimited { retry_after })
      }
    }
  }

  /// Drops windows that have fully expired.
  pub fn purge_expired(&self, now: Instant) {
    self.windows.retain(|_, w| now.saturating_duration_since(w.start) < WINDOW);
  }

  pub fn tracked_callers(&self) -> usize {
    self.windows.len()
  }
}
