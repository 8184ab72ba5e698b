pub mod circuit_breaker;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod feature_flags;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod rate_limiter;
pub mod retry;
pub mod routes;
pub mod store;
pub mod timer;
pub mod worker_processing;
pub mod worker_scheduler;
