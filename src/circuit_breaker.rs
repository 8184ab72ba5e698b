//! Per-dependency circuit breakers.
//!
//! Each monitored dependency gets its own breaker, created lazily on first use.
//! An OPEN breaker fails fast until `open_timeout` has elapsed; the next
//! `allow` call then moves it to HALF_OPEN and admits exactly one probe. The
//! probe is bound to the breaker's open epoch so a stale release can never
//! free a newer probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{EventRecorder, TaskEvent, TracingRecorder};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
  pub failure_threshold: u32,
  pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      open_timeout: Duration::from_secs(60),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
  Closed,
  Open,
  HalfOpen,
}

/// How an attempt was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Closed,
  Probe { epoch: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
  pub state: CircuitState,
  pub consecutive_failures: u32,
  pub opened_at: Option<Instant>,
  pub probe_in_flight: bool,
}

#[derive(Debug)]
struct Breaker {
  state: CircuitState,
  consecutive_failures: u32,
  opened_at: Option<Instant>,
  epoch: u64,
  probe_in_flight: bool,
}

impl Breaker {
  fn new() -> Self {
    Self {
      state: CircuitState::Closed,
      consecutive_failures: 0,
      opened_at: None,
      epoch: 0,
      probe_in_flight: false,
    }
  }

  fn open(&mut self, now: Instant) {
    self.state = CircuitState::Open;
    self.opened_at = Some(now);
    self.epoch += 1;
    self.probe_in_flight = false;
  }
}

pub struct CircuitBreakerRegistry {
  config: CircuitBreakerConfig,
  breakers: DashMap<String, Arc<Mutex<Breaker>>>,
  events: Arc<dyn EventRecorder>,
}

impl CircuitBreakerRegistry {
  pub fn new(config: CircuitBreakerConfig) -> Self {
    Self::with_recorder(config, Arc::new(TracingRecorder))
  }

  pub fn with_recorder(config: CircuitBreakerConfig, events: Arc<dyn EventRecorder>) -> Self {
    Self {
      config,
      breakers: DashMap::new(),
      events,
    }
  }

  fn breaker(&self, dependency: &str) -> Arc<Mutex<Breaker>> {
    if let Some(existing) = self.breakers.get(dependency) {
      return existing.clone();
    }
    self
      .breakers
      .entry(dependency.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(Breaker::new())))
      .clone()
  }

  fn changed(&self, dependency: &str, from: CircuitState, to: CircuitState) {
    if from != to {
      self.events.record(TaskEvent::BreakerStateChanged {
        dependency: dependency.to_string(),
        from,
        to,
      });
    }
  }

  pub fn allow(&self, dependency: &str) -> bool {
    self.admit(dependency).is_some()
  }

  pub fn admit(&self, dependency: &str) -> Option<Admission> {
    self.admit_at(dependency, Instant::now())
  }

  pub fn admit_at(&self, dependency: &str, now: Instant) -> Option<Admission> {
    let breaker = self.breaker(dependency);
    let (from, to, admission) = {
      let mut b = breaker.lock();
      let from = b.state;
      if b.state == CircuitState::Open {
        let elapsed = b.opened_at.map_or(true, |at| now.saturating_duration_since(at) >= self.config.open_timeout);
        if elapsed {
          b.state = CircuitState::HalfOpen;
          b.probe_in_flight = false;
        }
      }
      let admission = match b.state {
        CircuitState::Closed => Some(Admission::Closed),
        CircuitState::Open => None,
        CircuitState::HalfOpen if b.probe_in_flight => None,
        CircuitState::HalfOpen => {
          b.probe_in_flight = true;
          Some(Admission::Probe { epoch: b.epoch })
        }
      };
      (from, b.state, admission)
    };
    self.changed(dependency, from, to);
    if let Some(Admission::Probe { epoch }) = admission {
      debug!(dependency = %dependency, epoch, "Half-open probe admitted");
    }
    admission
  }

  pub fn record_success(&self, dependency: &str) {
    let breaker = self.breaker(dependency);
    let (from, to) = {
      let mut b = breaker.lock();
      let from = b.state;
      match b.state {
        CircuitState::HalfOpen => {
          b.state = CircuitState::Closed;
          b.consecutive_failures = 0;
          b.opened_at = None;
          b.probe_in_flight = false;
        }
        CircuitState::Closed => b.consecutive_failures = 0,
        // Late report from an attempt admitted before the breaker opened.
        CircuitState::Open => {}
      }
      (from, b.state)
    };
    self.changed(dependency, from, to);
  }

  pub fn record_failure(&self, dependency: &str) {
    self.record_failure_at(dependency, Instant::now())
  }

  pub fn record_failure_at(&self, dependency: &str, now: Instant) {
    let breaker = self.breaker(dependency);
    let (from, to) = {
      let mut b = breaker.lock();
      let from = b.state;
      b.consecutive_failures = b.consecutive_failures.saturating_add(1);
      match b.state {
        CircuitState::Closed if b.consecutive_failures >= self.config.failure_threshold => b.open(now),
        CircuitState::HalfOpen => b.open(now),
        _ => {}
      }
      (from, b.state)
    };
    self.changed(dependency, from, to);
  }

  /// Frees a HALF_OPEN probe whose outcome will never be reported.
  pub fn release_probe(&self, dependency: &str, epoch: u64) {
    let breaker = self.breaker(dependency);
    let mut b = breaker.lock();
    if b.state == CircuitState::HalfOpen && b.epoch == epoch {
      b.probe_in_flight = false;
    }
  }

  pub fn state(&self, dependency: &str) -> CircuitState {
    self.snapshot(dependency).state
  }

  pub fn snapshot(&self, dependency: &str) -> BreakerSnapshot {
    let breaker = self.breaker(dependency);
    let b = breaker.lock();
    BreakerSnapshot {
      state: b.state,
      consecutive_failures: b.consecutive_failures,
      opened_at: b.opened_at,
      probe_in_flight: b.probe_in_flight,
    }
  }
}
