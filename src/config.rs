use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dispatcher::DispatcherConfig;
use crate::models::{DEFAULT_MAX_RETRIES, MAX_RETRIES_LIMIT};
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::RetryConfig;

const ENVIRONMENTS: [&str; 4] = ["development", "testing", "staging", "production"];

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub environment: String,
  pub log_level: String,
  pub rate_limit_per_minute: u32,
  pub failure_threshold: u32,
  pub open_timeout: Duration,
  pub retry_base_delay: Duration,
  pub retry_max_delay: Duration,
  pub retry_jitter: bool,
  pub max_retries: u32,
  pub ack_timeout: Duration,
  pub task_time_limit: Duration,
  pub task_dependencies: HashMap<String, String>,
  pub worker_id: String,
  pub worker_concurrency: usize,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
  match lookup(key) {
    Some(raw) => raw
      .trim()
      .parse()
      .map_err(|_| anyhow!("{} has an invalid value: {}", key, raw)),
    None => Ok(default),
  }
}

/// `charge=payments,send_email=smtp`
fn parse_dependencies(raw: &str) -> Result<HashMap<String, String>> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|pair| !pair.is_empty())
    .map(|pair| {
      let (task_type, dependency) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("TASK_DEPENDENCIES entry '{}' is not task_type=dependency", pair))?;
      Ok((task_type.trim().to_string(), dependency.trim().to_string()))
    })
    .collect()
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let config = Self {
      database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
      rabbitmq_url: lookup("RABBITMQ_URL").context("RABBITMQ_URL must be set")?,
      server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
      environment: lookup("ENVIRONMENT").unwrap_or_else(|| "production".into()),
      log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
      rate_limit_per_minute: parse_or(&lookup, "RATE_LIMIT_PER_MINUTE", 60)?,
      failure_threshold: parse_or(&lookup, "CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5)?,
      open_timeout: Duration::from_secs(parse_or(&lookup, "CIRCUIT_BREAKER_TIMEOUT_SECS", 60)?),
      retry_base_delay: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 1_000)?),
      retry_max_delay: Duration::from_millis(parse_or(&lookup, "RETRY_MAX_DELAY_MS", 60_000)?),
      retry_jitter: parse_or(&lookup, "RETRY_JITTER", true)?,
      max_retries: parse_or(&lookup, "TASK_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
      ack_timeout: Duration::from_secs(parse_or(&lookup, "DISPATCH_ACK_TIMEOUT_SECS", 300)?),
      task_time_limit: Duration::from_secs(parse_or(&lookup, "TASK_TIME_LIMIT_SECS", 30 * 60)?),
      task_dependencies: parse_dependencies(&lookup("TASK_DEPENDENCIES").unwrap_or_default())?,
      worker_id: lookup("WORKER_ID").unwrap_or_else(|| "worker-1".into()),
      worker_concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", 4)?,
    };
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if !self.database_url.starts_with("postgres://") && !self.database_url.starts_with("postgresql://") {
      bail!("Invalid database URL format");
    }
    if !ENVIRONMENTS.contains(&self.environment.as_str()) {
      bail!("ENVIRONMENT must be one of {:?}", ENVIRONMENTS);
    }
    if self.rate_limit_per_minute == 0 || self.failure_threshold == 0 || self.worker_concurrency == 0 {
      bail!("rate limit, failure threshold and worker concurrency must be positive");
    }
    if self.max_retries > MAX_RETRIES_LIMIT {
      bail!("TASK_MAX_RETRIES must not exceed {}", MAX_RETRIES_LIMIT);
    }
    if self.retry_base_delay > self.retry_max_delay {
      bail!("RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS");
    }
    Ok(())
  }

  pub fn is_production(&self) -> bool {
    self.environment == "production"
  }

  pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
      failure_threshold: self.failure_threshold,
      open_timeout: self.open_timeout,
    }
  }

  pub fn rate_limiter(&self) -> RateLimiterConfig {
    RateLimiterConfig { limit_per_minute: self.rate_limit_per_minute }
  }

  pub fn dispatcher(&self) -> DispatcherConfig {
    DispatcherConfig {
      dependencies: self.task_dependencies.clone(),
      default_max_retries: self.max_retries,
      ack_timeout: self.ack_timeout,
      execution_timeout: self.task_time_limit,
      retry: RetryConfig {
        base_delay: self.retry_base_delay,
        max_delay: self.retry_max_delay,
        jitter: self.retry_jitter,
      },
      ..DispatcherConfig::default()
    }
  }
}
