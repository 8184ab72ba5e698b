use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::messaging::{Revocation, TaskMessage};

/// How long a revocation is remembered. Revocations are spread across
/// workers, so most never meet the delivery they target.
pub const REVOCATION_TTL: Duration = Duration::from_secs(60 * 60);

/// A delivery waiting for a free worker slot. `D` is the transport's handle
/// used to acknowledge it.
#[derive(Debug)]
pub struct ScheduledTask<D> {
  pub priority: u8,
  pub seq: u64,
  pub delivery: D,
  pub message: TaskMessage,
}

impl<D> Eq for ScheduledTask<D> {}

impl<D> PartialEq for ScheduledTask<D> {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.seq == other.seq
  }
}

impl<D> PartialOrd for ScheduledTask<D> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// Highest priority first, FIFO within a priority.
impl<D> Ord for ScheduledTask<D> {
  fn cmp(&self, other: &Self) -> Ordering {
    self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
  }
}

pub struct Scheduler<D> {
  queue: Mutex<BinaryHeap<ScheduledTask<D>>>,
  seq: AtomicU64,
}

impl<D> Default for Scheduler<D> {
  fn default() -> Self {
    Self::new()
  }
}

impl<D> Scheduler<D> {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
      seq: AtomicU64::new(0),
    }
  }

  pub async fn add_task(&self, delivery: D, message: TaskMessage) {
    let task = ScheduledTask {
      priority: message.priority.weight(),
      seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
      delivery,
      message,
    };
    self.queue.lock().await.push(task);
  }

  pub async fn get_next(&self) -> Option<ScheduledTask<D>> {
    self.queue.lock().await.pop()
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }
}

/// Revoked attempts known to this worker, per task.
#[derive(Debug)]
pub struct Revocations {
  entries: DashMap<Uuid, (u32, Instant)>,
  ttl: Duration,
}

impl Default for Revocations {
  fn default() -> Self {
    Self::new(REVOCATION_TTL)
  }
}

impl Revocations {
  pub fn new(ttl: Duration) -> Self {
    Self { entries: DashMap::new(), ttl }
  }

  pub fn revoke(&self, revocation: Revocation) {
    self.revoke_at(revocation, Instant::now())
  }

  pub fn revoke_at(&self, revocation: Revocation, now: Instant) {
    let mut entry = self.entries.entry(revocation.task_id).or_insert((revocation.attempt, now));
    if revocation.attempt >= entry.0 {
      *entry = (revocation.attempt, now);
    }
  }

  /// True when the message's attempt has been revoked. A newer attempt
  /// clears the entry.
  pub fn should_skip(&self, message: &TaskMessage) -> bool {
    let revoked = self.entries.get(&message.task_id).map(|e| e.0);
    match revoked {
      Some(attempt) if message.attempt <= attempt => true,
      Some(_) => {
        self
          .entries
          .remove_if(&message.task_id, |_, (attempt, _)| message.attempt > *attempt);
        false
      }
      None => false,
    }
  }

  pub fn prune(&self) {
    self.prune_at(Instant::now())
  }

  pub fn prune_at(&self, now: Instant) {
    self
      .entries
      .retain(|_, (_, revoked_at)| now.saturating_duration_since(*revoked_at) < self.ttl);
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
