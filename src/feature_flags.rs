use async_trait::async_trait;
use dashmap::DashMap;

pub const MAINTENANCE_MODE: &str = "maintenance_mode";

/// External key-value flag store consulted at admission time.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
  /// Unknown flags read as `None`.
  async fn get(&self, feature: &str) -> Option<bool>;
  async fn set(&self, feature: &str, enabled: bool);

  async fn is_enabled(&self, feature: &str) -> bool {
    self.get(feature).await.unwrap_or(false)
  }
}

pub fn task_type_flag(task_type: &str) -> String {
  format!("task_type.{}", task_type)
}

#[derive(Debug, Default)]
pub struct InMemoryFeatureFlags {
  flags: DashMap<String, bool>,
}

impl InMemoryFeatureFlags {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl FeatureFlags for InMemoryFeatureFlags {
  async fn get(&self, feature: &str) -> Option<bool> {
    self.flags.get(feature).map(|v| *v)
  }

  async fn set(&self, feature: &str, enabled: bool) {
    self.flags.insert(feature.to_string(), enabled);
  }
}
