use chrono::Utc;
use serde_json::json;
use warp::Filter;

pub fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .map(|| warp::reply::json(&json!({ "status": "healthy", "timestamp": Utc::now() })))
}

pub fn metrics_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("metrics")
    .and(warp::path::end())
    .and(warp::get())
    .map(|| "taskplane_metrics_placeholder")
}
