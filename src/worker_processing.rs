use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lapin::Channel;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::info;
use uuid::Uuid;

use crate::messaging::{CALLBACK_QUEUE, TaskMessage, WorkerCallback, publish_json};

/// Where a worker sends its callbacks.
#[async_trait]
pub trait CallbackSink: Send + Sync {
  async fn send(&self, callback: WorkerCallback) -> Result<()>;
}

#[async_trait]
impl CallbackSink for Channel {
  async fn send(&self, callback: WorkerCallback) -> Result<()> {
    publish_json(self, CALLBACK_QUEUE, &callback).await
  }
}

async fn report_progress(sink: &dyn CallbackSink, task_id: Uuid, percent: i64) -> Result<()> {
  sink.send(WorkerCallback::Progress { task_id, percent }).await
}

fn require_str<'a>(parameters: &'a Value, field: &str) -> Result<&'a str> {
  parameters
    .get(field)
    .and_then(Value::as_str)
    .ok_or_else(|| anyhow!("Missing field '{}'", field))
}

fn require_field<'a>(parameters: &'a Value, field: &str) -> Result<&'a Value> {
  parameters.get(field).ok_or_else(|| anyhow!("Missing field '{}'", field))
}

async fn run_steps(sink: &dyn CallbackSink, task_id: Uuid, steps: &[i64], step_delay: Duration) -> Result<()> {
  for progress in steps {
    sleep(step_delay).await;
    report_progress(sink, task_id, *progress).await?;
  }
  Ok(())
}

pub async fn process_email_task(message: &TaskMessage, sink: &dyn CallbackSink, step_delay: Duration) -> Result<Value> {
  for field in ["from", "to", "subject", "content"] {
    require_str(&message.parameters, field)?;
  }
  run_steps(sink, message.task_id, &[20, 40, 60, 80], step_delay).await?;
  Ok(json!({ "delivered_to": message.parameters["to"] }))
}

pub async fn process_image_task(message: &TaskMessage, sink: &dyn CallbackSink, step_delay: Duration) -> Result<Value> {
  let src = require_str(&message.parameters, "img_src")?;
  let factor = require_field(&message.parameters, "resize_factor")?;
  run_steps(sink, message.task_id, &[50], step_delay).await?;
  Ok(json!({ "img_src": src, "resize_factor": factor }))
}

pub async fn process_video_task(message: &TaskMessage, sink: &dyn CallbackSink, step_delay: Duration) -> Result<Value> {
  let src = require_str(&message.parameters, "vid_src")?;
  let factor = require_field(&message.parameters, "resize_factor")?;
  run_steps(sink, message.task_id, &[25, 50, 75], step_delay).await?;
  Ok(json!({ "vid_src": src, "resize_factor": factor }))
}

pub async fn process_report_task(message: &TaskMessage, sink: &dyn CallbackSink, step_delay: Duration) -> Result<Value> {
  let report_type = require_str(&message.parameters, "report_type")?;
  let format = message.parameters.get("format").and_then(Value::as_str).unwrap_or("pdf");
  run_steps(sink, message.task_id, &[30, 60, 90], step_delay).await?;
  Ok(json!({ "report": format!("{}.{}", report_type, format) }))
}

pub async fn process_data_task(message: &TaskMessage, sink: &dyn CallbackSink, step_delay: Duration) -> Result<Value> {
  let source = require_str(&message.parameters, "data_source")?;
  let output = message.parameters.get("output_format").and_then(Value::as_str).unwrap_or("parquet");
  run_steps(sink, message.task_id, &[10, 35, 70], step_delay).await?;
  Ok(json!({ "source": source, "output_format": output }))
}

/// Runs one attempt end to end, reporting start, progress and the outcome.
/// Only a failure to deliver callbacks is returned as an error.
pub async fn execute(message: &TaskMessage, sink: &dyn CallbackSink, worker_id: &str, step_delay: Duration) -> Result<()> {
  let task_id = message.task_id;
  info!("Worker {}: Processing {} task {} (attempt {})", worker_id, message.task_type, task_id, message.attempt);
  sink.send(WorkerCallback::Start { task_id }).await?;

  let outcome = match message.task_type.as_str() {
    "email" => process_email_task(message, sink, step_delay).await,
    "image" => process_image_task(message, sink, step_delay).await,
    "video" => process_video_task(message, sink, step_delay).await,
    "report_generation" => process_report_task(message, sink, step_delay).await,
    "data_processing" => process_data_task(message, sink, step_delay).await,
    other => Err(anyhow!("Unknown task type: {}", other)),
  };

  let callback = match outcome {
    Ok(result) => WorkerCallback::Success { task_id, result: Some(result) },
    Err(e) => WorkerCallback::Failure { task_id, error: e.to_string() },
  };
  if let WorkerCallback::Failure { error, .. } = &callback {
    info!("Worker {}: Task {} failed: {}", worker_id, task_id, error);
  }
  sink.send(callback).await
}
