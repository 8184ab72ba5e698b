use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::models::Task;

/// Durable home of task rows. Reads after a write for the same task must
/// observe that write.
#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn save(&self, task: &Task) -> TaskResult<()>;
  async fn load(&self, task_id: Uuid) -> TaskResult<Task>;
  async fn update(&self, task: &Task) -> TaskResult<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
  tasks: DashMap<Uuid, Task>,
}

impl InMemoryTaskStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
  async fn save(&self, task: &Task) -> TaskResult<()> {
    match self.tasks.entry(task.id) {
      Entry::Occupied(_) => Err(TaskError::Validation(format!("task {} already exists", task.id))),
      Entry::Vacant(slot) => {
        slot.insert(task.clone());
        Ok(())
      }
    }
  }

  async fn load(&self, task_id: Uuid) -> TaskResult<Task> {
    self
      .tasks
      .get(&task_id)
      .map(|t| t.clone())
      .ok_or(TaskError::NotFound(task_id))
  }

  async fn update(&self, task: &Task) -> TaskResult<()> {
    match self.tasks.get_mut(&task.id) {
      Some(mut row) => {
        *row = task.clone();
        Ok(())
      }
      None => Err(TaskError::NotFound(task.id)),
    }
  }
}
