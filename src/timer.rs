use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

/// Deferred work the dispatcher hands to the timer. `attempt` is the task's
/// `retry_count` when the action was armed; a mismatch on firing means the
/// action is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
  Enqueue { task_id: Uuid, attempt: u32 },
  AckDeadline { task_id: Uuid, attempt: u32 },
  ExecutionDeadline { task_id: Uuid, attempt: u32 },
}

#[derive(Debug)]
struct ScheduledAction {
  due: Instant,
  seq: u64,
  action: TimerAction,
}

impl Eq for ScheduledAction {}

impl PartialEq for ScheduledAction {
  fn eq(&self, other: &Self) -> bool {
    self.due == other.due && self.seq == other.seq
  }
}

impl PartialOrd for ScheduledAction {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Earliest deadline on top of the max-heap; ties fire in scheduling order.
impl Ord for ScheduledAction {
  fn cmp(&self, other: &Self) -> Ordering {
    other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
  }
}

pub struct Timer {
  queue: Mutex<BinaryHeap<ScheduledAction>>,
  seq: AtomicU64,
  wakeup: Notify,
}

impl Default for Timer {
  fn default() -> Self {
    Self::new()
  }
}

impl Timer {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
      seq: AtomicU64::new(0),
      wakeup: Notify::new(),
    }
  }

  pub async fn schedule(&self, due: Instant, action: TimerAction) {
    let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
    self.queue.lock().await.push(ScheduledAction { due, seq, action });
    self.wakeup.notify_one();
  }

  /// Waits until the earliest action is due and returns it. Never returns an
  /// action before its deadline.
  pub async fn next_due(&self) -> TimerAction {
    loop {
      let next = self.queue.lock().await.peek().map(|s| s.due);
      match next {
        None => self.wakeup.notified().await,
        Some(due) if due <= Instant::now() => {
          let mut queue = self.queue.lock().await;
          if queue.peek().is_some_and(|s| s.due <= Instant::now()) {
            if let Some(scheduled) = queue.pop() {
              return scheduled.action;
            }
          }
        }
        Some(due) => {
          tokio::select! {
            _ = sleep_until(due) => {}
            _ = self.wakeup.notified() => {}
          }
        }
      }
    }
  }

  pub async fn pending(&self) -> usize {
    self.queue.lock().await.len()
  }
}
