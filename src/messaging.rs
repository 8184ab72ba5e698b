use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::{TaskError, TaskResult};
use crate::models::{Task, TaskPriority};

static MAX_RETRIES: usize = 5;
// 2^n * 50ms: 100ms, 200ms, 400ms, ... capped at MAX_BACKOFF.
const BACKOFF_BASE: u64 = 2;
const BACKOFF_FACTOR: u64 = 50;
const MAX_BACKOFF: Duration = Duration::from_secs(2);
/// Bound on one publish including its broker confirm.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub const HIGH_PRIORITY_QUEUE: &str = "high_priority";
pub const DEFAULT_QUEUE: &str = "default";
pub const CALLBACK_QUEUE: &str = "task_callbacks";
pub const REVOCATION_QUEUE: &str = "task_revocations";

/// What travels to a worker: a reference to the task plus what it needs to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
  pub task_id: Uuid,
  pub task_type: String,
  pub parameters: serde_json::Value,
  pub priority: TaskPriority,
  pub attempt: u32,
  pub not_before: Option<DateTime<Utc>>,
}

impl TaskMessage {
  pub fn for_attempt(task: &Task) -> Self {
    Self {
      task_id: task.id,
      task_type: task.task_type.clone(),
      parameters: task.parameters.clone(),
      priority: task.priority,
      attempt: task.retry_count,
      not_before: task.scheduled_at,
    }
  }
}

/// Outcome reports sent by workers back to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerCallback {
  Start { task_id: Uuid },
  Progress { task_id: Uuid, percent: i64 },
  Success { task_id: Uuid, result: Option<serde_json::Value> },
  Failure { task_id: Uuid, error: String },
}

impl WorkerCallback {
  pub fn task_id(&self) -> Uuid {
    match self {
      WorkerCallback::Start { task_id }
      | WorkerCallback::Progress { task_id, .. }
      | WorkerCallback::Success { task_id, .. }
      | WorkerCallback::Failure { task_id, .. } => *task_id,
    }
  }
}

/// Cancels one attempt of a task and every earlier one; a later attempt of
/// the same task still runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
  pub task_id: Uuid,
  pub attempt: u32,
}

/// At-least-once delivery of work items to workers.
#[async_trait]
pub trait TaskTransport: Send + Sync {
  async fn enqueue(&self, queue: &str, message: &TaskMessage, not_before: Option<DateTime<Utc>>) -> Result<()>;

  /// Best effort; a worker already running the attempt may still finish it.
  async fn revoke(&self, task_id: Uuid, attempt: u32) -> Result<()>;
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(broker_backoff(), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;

  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn declare_queues(channel: &Channel) -> Result<()> {
  for queue in [HIGH_PRIORITY_QUEUE, DEFAULT_QUEUE, CALLBACK_QUEUE, REVOCATION_QUEUE] {
    channel
      .queue_declare(queue, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
      .await?;
  }
  Ok(())
}

/// Delays between broker connection and publish attempts, in order.
pub fn broker_backoff() -> impl Iterator<Item = Duration> {
  ExponentialBackoff::from_millis(BACKOFF_BASE)
    .factor(BACKOFF_FACTOR)
    .max_delay(MAX_BACKOFF)
    .take(MAX_RETRIES)
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
  Retry::spawn(broker_backoff(), || async {
    let confirm = timeout(PUBLISH_TIMEOUT, async {
      channel
        .basic_publish("", queue, BasicPublishOptions::default(), payload, BasicProperties::default())
        .await?
        .await
    })
    .await??;
    Ok::<_, anyhow::Error>(confirm)
  })
    .await?;
  Ok(())
}

pub async fn publish_json<T: Serialize>(channel: &Channel, queue: &str, value: &T) -> Result<()> {
  let payload = serde_json::to_vec(value)?;
  publish_message(channel, queue, &payload).await
}

#[derive(Clone)]
pub struct RabbitTransport {
  channel: Channel,
}

impl RabbitTransport {
  pub fn new(channel: Channel) -> Self {
    Self { channel }
  }
}

#[async_trait]
impl TaskTransport for RabbitTransport {
  async fn enqueue(&self, queue: &str, message: &TaskMessage, not_before: Option<DateTime<Utc>>) -> Result<()> {
    let mut message = message.clone();
    message.not_before = not_before;
    publish_json(&self.channel, queue, &message).await
  }

  async fn revoke(&self, task_id: Uuid, attempt: u32) -> Result<()> {
    publish_json(&self.channel, REVOCATION_QUEUE, &Revocation { task_id, attempt }).await
  }
}

/// Records sends instead of delivering them.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
  sent: Mutex<Vec<(String, TaskMessage)>>,
  revoked: Mutex<Vec<Revocation>>,
}

impl InMemoryTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn sent(&self) -> Vec<(String, TaskMessage)> {
    self.sent.lock().clone()
  }

  pub fn sent_for(&self, task_id: Uuid) -> Vec<(String, TaskMessage)> {
    self.sent.lock().iter().filter(|(_, m)| m.task_id == task_id).cloned().collect()
  }

  pub fn revoked(&self) -> Vec<Uuid> {
    self.revoked.lock().iter().map(|r| r.task_id).collect()
  }

  pub fn revocations(&self) -> Vec<Revocation> {
    self.revoked.lock().clone()
  }
}

#[async_trait]
impl TaskTransport for InMemoryTransport {
  async fn enqueue(&self, queue: &str, message: &TaskMessage, not_before: Option<DateTime<Utc>>) -> Result<()> {
    let mut message = message.clone();
    message.not_before = not_before;
    self.sent.lock().push((queue.to_string(), message));
    Ok(())
  }

  async fn revoke(&self, task_id: Uuid, attempt: u32) -> Result<()> {
    self.revoked.lock().push(Revocation { task_id, attempt });
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  Ack,
  /// Hand the delivery back to the broker for another try.
  Requeue,
}

/// Storage and transport failures leave the task untouched, so the callback
/// is redelivered. Everything else has been applied or can never apply.
pub fn disposition(result: &TaskResult<Outcome>) -> Disposition {
  match result {
    Err(TaskError::Storage(_)) | Err(TaskError::Transport(_)) => Disposition::Requeue,
    _ => Disposition::Ack,
  }
}

/// Feeds worker callbacks from the broker into the dispatcher until the
/// consumer stream ends.
pub async fn consume_callbacks(channel: Channel, dispatcher: Arc<Dispatcher>) -> Result<()> {
  let mut consumer = channel
    .basic_consume(CALLBACK_QUEUE, "control_plane", BasicConsumeOptions::default(), FieldTable::default())
    .await?;

  while let Some(delivery) = consumer.next().await {
    let delivery = match delivery {
      Ok(delivery) => delivery,
      Err(e) => {
        error!("Callback consumer error: {:?}", e);
        continue;
      }
    };

    let verdict = match serde_json::from_slice::<WorkerCallback>(&delivery.data) {
      Ok(callback) => {
        let task_id = callback.task_id();
        let result = dispatcher.handle_callback(callback).await;
        if let Err(e) = &result {
          error!(task_id = %task_id, "Failed to apply worker callback: {}", e);
        }
        disposition(&result)
      }
      Err(e) => {
        warn!("Discarding malformed callback: {:?}", e);
        Disposition::Ack
      }
    };

    let settled = match verdict {
      Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
      Disposition::Requeue => {
        delivery
          .nack(BasicNackOptions { requeue: true, ..Default::default() })
          .await
      }
    };
    if let Err(e) = settled {
      error!(disposition = ?verdict, "Failed to settle callback delivery: {:?}", e);
    }
  }
  Ok(())
}
