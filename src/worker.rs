use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use taskplane::config::Config;
use taskplane::logging::init_tracing;
use taskplane::messaging::{
  create_rabbit_channel, declare_queues, Revocation, TaskMessage, DEFAULT_QUEUE, HIGH_PRIORITY_QUEUE, REVOCATION_QUEUE,
};
use taskplane::worker_processing::execute;
use taskplane::worker_scheduler::{Revocations, Scheduler};

const STEP_DELAY: Duration = Duration::from_secs(3);

async fn consume_tasks(channel: Channel, queue: &'static str, worker_id: String, scheduler: Arc<Scheduler<Delivery>>) -> Result<()> {
  let mut consumer = channel
    .basic_consume(queue, &format!("{}-{}", worker_id, queue), BasicConsumeOptions::default(), FieldTable::default())
    .await?;

  while let Some(delivery) = consumer.next().await {
    match delivery {
      Ok(delivery) => match serde_json::from_slice::<TaskMessage>(&delivery.data) {
        Ok(message) => scheduler.add_task(delivery, message).await,
        Err(e) => {
          error!("Failed to parse task: {:?}", e);
          let _ = delivery.ack(BasicAckOptions::default()).await;
        }
      },
      Err(e) => error!("Consumer error: {:?}", e),
    }
  }
  Ok(())
}

async fn consume_revocations(channel: Channel, worker_id: String, revoked: Arc<Revocations>) -> Result<()> {
  let mut consumer = channel
    .basic_consume(REVOCATION_QUEUE, &format!("{}-revocations", worker_id), BasicConsumeOptions::default(), FieldTable::default())
    .await?;

  while let Some(delivery) = consumer.next().await {
    let Ok(delivery) = delivery else { continue };
    if let Ok(revocation) = serde_json::from_slice::<Revocation>(&delivery.data) {
      info!("Task {} revoked up to attempt {}", revocation.task_id, revocation.attempt);
      revoked.revoke(revocation);
    }
    let _ = delivery.ack(BasicAckOptions::default()).await;
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  let config = Config::from_env()?;
  init_tracing(&config.log_level);

  let channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  declare_queues(&channel).await?;
  channel
    .basic_qos(config.worker_concurrency as u16, BasicQosOptions::default())
    .await?;

  let scheduler = Arc::new(Scheduler::new());
  let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));
  let revoked = Arc::new(Revocations::default());

  for queue in [HIGH_PRIORITY_QUEUE, DEFAULT_QUEUE] {
    let channel = channel.clone();
    let scheduler = scheduler.clone();
    let worker_id = config.worker_id.clone();
    tokio::spawn(async move {
      if let Err(e) = consume_tasks(channel, queue, worker_id, scheduler).await {
        error!("Consumer for {} stopped: {:?}", queue, e);
      }
    });
  }
  {
    let channel = channel.clone();
    let worker_id = config.worker_id.clone();
    let revoked = revoked.clone();
    tokio::spawn(async move {
      if let Err(e) = consume_revocations(channel, worker_id, revoked).await {
        error!("Revocation consumer stopped: {:?}", e);
      }
    });
  }

  {
    let revoked = revoked.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(60));
      loop {
        interval.tick().await;
        revoked.prune();
      }
    });
  }

  info!("Worker {} started with concurrency {}", config.worker_id, config.worker_concurrency);
  loop {
    let Some(scheduled) = scheduler.get_next().await else {
      tokio::time::sleep(Duration::from_millis(100)).await;
      continue;
    };

    if revoked.should_skip(&scheduled.message) {
      warn!("Skipping revoked task {} attempt {}", scheduled.message.task_id, scheduled.message.attempt);
      let _ = scheduled.delivery.ack(BasicAckOptions::default()).await;
      continue;
    }

    let permit = semaphore.clone().acquire_owned().await?;
    let channel = channel.clone();
    let worker_id = config.worker_id.clone();
    tokio::spawn(async move {
      let message = scheduled.message;
      if let Err(e) = execute(&message, &channel, &worker_id, STEP_DELAY).await {
        error!("Failed to report outcome for task {}: {:?}", message.task_id, e);
      }
      let _ = scheduled.delivery.ack(BasicAckOptions::default()).await;
      drop(permit);
    });
  }
}
