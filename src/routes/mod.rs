use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tracing::error;
use warp::http::{HeaderValue, StatusCode};
use warp::{Filter, Rejection, Reply};

use crate::dispatcher::Dispatcher;
use crate::error::TaskError;
use crate::feature_flags::FeatureFlags;
use crate::rate_limiter::RateLimiter;

pub mod health;
pub mod tasks;

#[derive(Clone)]
pub struct AppState {
  pub dispatcher: Arc<Dispatcher>,
  pub rate_limiter: Arc<RateLimiter>,
  pub flags: Arc<dyn FeatureFlags>,
}

#[derive(Debug)]
pub enum ApiError {
  Task(TaskError),
  Unavailable(String),
}

impl warp::reject::Reject for ApiError {}

impl From<TaskError> for ApiError {
  fn from(err: TaskError) -> Self {
    ApiError::Task(err)
  }
}

pub fn reject(err: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(err.into())
}

pub fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  tasks::submit_route(state.clone())
    .or(tasks::get_route(state.clone()))
    .or(tasks::cancel_route(state))
    .or(health::health_route())
    .or(health::metrics_route())
    .recover(handle_rejection)
}

fn error_reply(status: StatusCode, message: String) -> warp::reply::Response {
  warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status).into_response()
}

fn api_error_reply(err: &ApiError) -> warp::reply::Response {
  let task_err = match err {
    ApiError::Unavailable(message) => return error_reply(StatusCode::SERVICE_UNAVAILABLE, message.clone()),
    ApiError::Task(task_err) => task_err,
  };
  let status = match task_err {
    TaskError::Validation(_) => StatusCode::BAD_REQUEST,
    TaskError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
    TaskError::NotFound(_) => StatusCode::NOT_FOUND,
    TaskError::InvalidTransition { .. } | TaskError::RetriesExhausted { .. } => StatusCode::CONFLICT,
    TaskError::DependencyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    TaskError::Storage(_) | TaskError::Transport(_) => {
      error!("Request failed: {}", task_err);
      StatusCode::INTERNAL_SERVER_ERROR
    }
  };
  let message = if task_err.is_rejection() || status == StatusCode::NOT_FOUND {
    task_err.to_string()
  } else {
    "Internal server error".to_string()
  };
  let mut response = error_reply(status, message);
  if let Some(retry_after) = task_err.retry_after() {
    let secs = retry_after.as_secs().max(1);
    response.headers_mut().insert("retry-after", HeaderValue::from(secs));
  }
  response
}

/// `ApiError` must be checked first; sibling routes on `/tasks/{id}` add a
/// `MethodNotAllowed` to the same combined rejection.
pub async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
  if let Some(api_err) = err.find::<ApiError>() {
    return Ok(api_error_reply(api_err));
  }
  if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    return Ok(error_reply(StatusCode::BAD_REQUEST, e.to_string()));
  }
  if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    return Ok(error_reply(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".into()));
  }
  if err.is_not_found() {
    return Ok(error_reply(StatusCode::NOT_FOUND, "Not found".into()));
  }
  error!("Unhandled rejection: {:?}", err);
  Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into()))
}
