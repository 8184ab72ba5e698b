use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::models::Task;
use crate::store::TaskStore;

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
  let pool = Pool::<Postgres>::connect(database_url).await?;

  MIGRATOR.run(&pool).await?;
  info!("Database migrations complete");
  Ok(pool)
}

#[derive(Clone)]
pub struct PgTaskStore {
  pool: PgPool,
}

impl PgTaskStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

fn task_from_row(row: &PgRow) -> TaskResult<Task> {
  let status: String = row.try_get("status")?;
  let priority: String = row.try_get("priority")?;
  let tags: Vec<String> = row.try_get("tags")?;
  let progress: i16 = row.try_get("progress")?;
  let retry_count: i32 = row.try_get("retry_count")?;
  let max_retries: i32 = row.try_get("max_retries")?;

  Ok(Task {
    id: row.try_get("id")?,
    name: row.try_get("name")?,
    description: row.try_get("description")?,
    task_type: row.try_get("task_type")?,
    parameters: row.try_get("parameters")?,
    tags: tags.into_iter().collect(),
    created_by: row.try_get("created_by")?,
    priority: priority.parse().map_err(TaskError::Validation)?,
    scheduled_at: row.try_get("scheduled_at")?,
    status: status.parse().map_err(TaskError::Validation)?,
    progress: progress.clamp(0, 100) as u8,
    started_at: row.try_get("started_at")?,
    completed_at: row.try_get("completed_at")?,
    error_message: row.try_get("error_message")?,
    result: row.try_get("result")?,
    retry_count: retry_count.max(0) as u32,
    max_retries: max_retries.max(0) as u32,
    created_at: row.try_get("created_at")?,
    updated_at: row.try_get("updated_at")?,
  })
}

#[async_trait]
impl TaskStore for PgTaskStore {
  async fn save(&self, task: &Task) -> TaskResult<()> {
    let tags: Vec<String> = task.tags.iter().cloned().collect();
    sqlx::query(
      "INSERT INTO tasks (id, name, description, task_type, parameters, tags, created_by, priority,
         scheduled_at, status, progress, started_at, completed_at, error_message, result,
         retry_count, max_retries, created_at, updated_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
    )
    .bind(task.id)
    .bind(&task.name)
    .bind(&task.description)
    .bind(&task.task_type)
    .bind(&task.parameters)
    .bind(tags)
    .bind(&task.created_by)
    .bind(task.priority.as_str())
    .bind(task.scheduled_at)
    .bind(task.status.as_str())
    .bind(task.progress as i16)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(&task.error_message)
    .bind(&task.result)
    .bind(task.retry_count as i32)
    .bind(task.max_retries as i32)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn load(&self, task_id: Uuid) -> TaskResult<Task> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or(TaskError::NotFound(task_id))?;
    task_from_row(&row)
  }

  async fn update(&self, task: &Task) -> TaskResult<()> {
    let result = sqlx::query(
      "UPDATE tasks SET status = $2, progress = $3, started_at = $4, completed_at = $5,
         error_message = $6, result = $7, retry_count = $8, updated_at = $9
       WHERE id = $1",
    )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(task.progress as i16)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(&task.error_message)
    .bind(&task.result)
    .bind(task.retry_count as i32)
    .bind(task.updated_at)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(TaskError::NotFound(task.id));
    }
    Ok(())
  }
}
