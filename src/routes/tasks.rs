use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{ApiError, AppState, reject, with_state};
use crate::dispatcher::Outcome;
use crate::error::TaskError;
use crate::feature_flags::{MAINTENANCE_MODE, task_type_flag};
use crate::models::{Task, TaskPriority};

const ANONYMOUS: &str = "anonymous";

static SAFE_TEXT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w\s.,@!?\-]+$").expect("valid regex"));
static TASK_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("valid regex"));

#[derive(Debug, Deserialize)]
pub struct NewTask {
  pub name: String,
  pub description: Option<String>,
  pub task_type: String,
  #[serde(default)]
  pub parameters: serde_json::Value,
  pub priority: Option<TaskPriority>,
  #[serde(default)]
  pub tags: Vec<String>,
  pub created_by: Option<String>,
  pub scheduled_at: Option<DateTime<Utc>>,
  pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
  pub task_id: Uuid,
  pub status: String,
  pub queue: String,
  pub status_url: String,
}

fn sanitize_input(input: &str) -> bool {
  SAFE_TEXT.is_match(input)
}

fn validate_request(new_task: &NewTask) -> Result<(), String> {
  if !sanitize_input(&new_task.name) {
    return Err("Invalid or unsafe value for field 'name'".into());
  }
  if !TASK_TYPE.is_match(&new_task.task_type) {
    return Err("Invalid 'task_type'".into());
  }
  if let Some(tag) = new_task.tags.iter().find(|t| !sanitize_input(t)) {
    return Err(format!("Invalid or unsafe tag '{}'", tag));
  }
  if let Some(created_by) = &new_task.created_by {
    if !sanitize_input(created_by) {
      return Err("Invalid or unsafe value for field 'created_by'".into());
    }
  }
  if !new_task.parameters.is_null() && !new_task.parameters.is_object() {
    return Err("'parameters' must be an object".into());
  }
  Ok(())
}

fn build_task(new_task: NewTask, caller: &str, default_max_retries: u32) -> Task {
  let parameters = match new_task.parameters {
    serde_json::Value::Null => serde_json::json!({}),
    other => other,
  };
  let mut task = Task::new(new_task.name, new_task.task_type)
    .with_priority(new_task.priority.unwrap_or_default())
    .with_max_retries(new_task.max_retries.unwrap_or(default_max_retries))
    .with_parameters(parameters);
  task.description = new_task.description;
  task.tags = new_task.tags.into_iter().collect();
  task.created_by = new_task.created_by.unwrap_or_else(|| caller.to_string());
  task.scheduled_at = new_task.scheduled_at;
  task
}

pub fn submit_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::header::optional::<String>("x-client-id"))
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_submit_task)
}

pub fn get_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_get_task)
}

pub fn cancel_route(state: AppState) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::delete())
    .and(with_state(state))
    .and_then(handle_cancel_task)
}

async fn handle_submit_task(
  client_id: Option<String>,
  new_task: NewTask,
  state: AppState,
) -> Result<impl warp::Reply, warp::Rejection> {
  let caller = client_id.unwrap_or_else(|| ANONYMOUS.to_string());
  state.rate_limiter.try_acquire(&caller).map_err(reject)?;

  if state.flags.is_enabled(MAINTENANCE_MODE).await {
    return Err(reject(ApiError::Unavailable("Submissions are paused for maintenance".into())));
  }
  if state.flags.get(&task_type_flag(&new_task.task_type)).await == Some(false) {
    return Err(reject(ApiError::Unavailable(format!("Task type '{}' is disabled", new_task.task_type))));
  }

  if let Err(e) = validate_request(&new_task) {
    error!("Payload validation failed: {}", e);
    return Err(reject(TaskError::Validation(e)));
  }

  let default_max_retries = state.dispatcher.config().default_max_retries;
  let task = build_task(new_task, &caller, default_max_retries);
  let receipt = state.dispatcher.submit(task).await.map_err(|e| {
    error!("Task submission failed: {}", e);
    reject(e)
  })?;

  info!("Task {} submitted successfully", receipt.task_id);
  let response = TaskResponse {
    task_id: receipt.task_id,
    status: "PENDING".into(),
    queue: receipt.queue,
    status_url: format!("/tasks/{}", receipt.task_id),
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::ACCEPTED))
}

async fn handle_get_task(task_id: Uuid, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let task = state.dispatcher.task(task_id).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_cancel_task(task_id: Uuid, state: AppState) -> Result<impl warp::Reply, warp::Rejection> {
  let outcome = state.dispatcher.cancel(task_id).await.map_err(reject)?;
  let (status, body) = match outcome {
    Outcome::Discarded(current) => (
      StatusCode::CONFLICT,
      serde_json::json!({ "error": format!("Task {} is already {}", task_id, current) }),
    ),
    _ => (
      StatusCode::OK,
      serde_json::json!({ "task_id": task_id, "status": "CANCELLED" }),
    ),
  };
  Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
