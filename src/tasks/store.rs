//! Durable task records, adapted from the A2A task lifecycle (spec.md §4.6):
//! `submitted -> working -> (input-required <-> working)* -> completed|failed|canceled`.

use crate::error::{Result, StoreError};
use crate::{AgentId, ChannelId, TaskId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Canceled,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Working => "working",
            TaskStatus::InputRequired => "input-required",
            TaskStatus::Completed => "completed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(TaskStatus::Submitted),
            "working" => Some(TaskStatus::Working),
            "input-required" => Some(TaskStatus::InputRequired),
            "completed" => Some(TaskStatus::Completed),
            "canceled" => Some(TaskStatus::Canceled),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Canceled | TaskStatus::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Valid status transitions for the A2A task state machine.
fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Submitted, Working)
            | (Submitted, Canceled)
            | (Submitted, Failed)
            | (Working, InputRequired)
            | (Working, Completed)
            | (Working, Failed)
            | (Working, Canceled)
            | (InputRequired, Working)
            | (InputRequired, Canceled)
            | (InputRequired, Failed)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub context_id: String,
    pub agent_id: AgentId,
    pub channel_id: Option<ChannelId>,
    pub session_key: Option<String>,
    pub status: TaskStatus,
    pub request: Value,
    pub response: Option<Value>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTaskInput {
    pub id: TaskId,
    pub context_id: String,
    pub agent_id: AgentId,
    pub channel_id: Option<ChannelId>,
    pub session_key: Option<String>,
    pub request: Value,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskInput {
    pub status: Option<TaskStatus>,
    pub response: Option<Value>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, input: CreateTaskInput) -> Result<Task>;
    async fn get(&self, id: &TaskId) -> Result<Option<Task>>;
    async fn update(&self, id: &TaskId, input: UpdateTaskInput) -> Result<Task>;
    async fn list_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Task>>;
    async fn list_active(&self) -> Result<Vec<Task>>;
}

/// `DashMap`-backed in-memory task store, grounded in the same
/// create/get/update/list surface as the durable backend.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, Task>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, input: CreateTaskInput) -> Result<Task> {
        if self.tasks.contains_key(&input.id) {
            return Err(StoreError::AlreadyExists {
                entity: "task",
                id: input.id.to_string(),
            }
            .into());
        }
        let now = Utc::now();
        let task = Task {
            id: input.id.clone(),
            context_id: input.context_id,
            agent_id: input.agent_id,
            channel_id: input.channel_id,
            session_key: input.session_key,
            status: TaskStatus::Submitted,
            request: input.request,
            response: None,
            worker_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(input.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn update(&self, id: &TaskId, input: UpdateTaskInput) -> Result<Task> {
        let mut entry = self.tasks.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "task",
            id: id.to_string(),
        })?;

        if let Some(status) = input.status {
            if status != entry.status && !can_transition(entry.status, status) {
                return Err(StoreError::InvalidTransition {
                    entity: "task",
                    id: id.to_string(),
                    detail: format!("{} -> {}", entry.status, status),
                }
                .into());
            }
            entry.status = status;
        }
        if let Some(response) = input.response {
            entry.response = Some(response);
        }
        if let Some(worker_id) = input.worker_id {
            entry.worker_id = Some(worker_id);
        }
        if let Some(error) = input.error {
            entry.error = Some(error);
        }
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn list_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| t.agent_id == *agent_id)
            .map(|t| t.clone())
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.clone())
            .collect())
    }
}

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                context_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                channel_id TEXT,
                session_key TEXT,
                status TEXT NOT NULL,
                request TEXT NOT NULL,
                response TEXT,
                worker_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, input: CreateTaskInput) -> Result<Task> {
        let now = Utc::now();
        let request_json = serde_json::to_string(&input.request)
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (id, context_id, agent_id, channel_id, session_key, status, request, response, worker_id, error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, ?8, ?8)
            "#,
        )
        .bind(input.id.as_ref())
        .bind(&input.context_id)
        .bind(input.agent_id.as_ref())
        .bind(input.channel_id.as_deref())
        .bind(&input.session_key)
        .bind(TaskStatus::Submitted.as_str())
        .bind(&request_json)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_error)) = &inserted {
            if db_error.code().as_deref() == Some("1555") || db_error.code().as_deref() == Some("2067") {
                return Err(StoreError::AlreadyExists {
                    entity: "task",
                    id: input.id.to_string(),
                }
                .into());
            }
        }
        inserted.map_err(crate::Error::from)?;

        Ok(Task {
            id: input.id,
            context_id: input.context_id,
            agent_id: input.agent_id,
            channel_id: input.channel_id,
            session_key: input.session_key,
            status: TaskStatus::Submitted,
            request: input.request,
            response: None,
            worker_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            "SELECT id, context_id, agent_id, channel_id, session_key, status, request, response, worker_id, error, created_at, updated_at FROM tasks WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, id: &TaskId, input: UpdateTaskInput) -> Result<Task> {
        let mut current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "task",
                id: id.to_string(),
            })?;

        if let Some(status) = input.status {
            if status != current.status && !can_transition(current.status, status) {
                return Err(StoreError::InvalidTransition {
                    entity: "task",
                    id: id.to_string(),
                    detail: format!("{} -> {}", current.status, status),
                }
                .into());
            }
            current.status = status;
        }
        if let Some(response) = input.response {
            current.response = Some(response);
        }
        if let Some(worker_id) = input.worker_id {
            current.worker_id = Some(worker_id);
        }
        if let Some(error) = input.error {
            current.error = Some(error);
        }
        current.updated_at = Utc::now();

        let response_json = current
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, response = ?2, worker_id = ?3, error = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(current.status.as_str())
        .bind(&response_json)
        .bind(&current.worker_id)
        .bind(&current.error)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        Ok(current)
    }

    async fn list_by_agent(&self, agent_id: &AgentId) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, context_id, agent_id, channel_id, session_key, status, request, response, worker_id, error, created_at, updated_at FROM tasks WHERE agent_id = ?1",
        )
        .bind(agent_id.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_active(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, context_id, agent_id, channel_id, session_key, status, request, response, worker_id, error, created_at, updated_at FROM tasks WHERE status NOT IN ('completed', 'canceled', 'failed')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    context_id: String,
    agent_id: String,
    channel_id: Option<String>,
    session_key: Option<String>,
    status: String,
    request: String,
    response: Option<String>,
    worker_id: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = crate::Error;

    fn try_from(row: TaskRow) -> std::result::Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Query(format!("unknown task status {}", row.status)))?;
        let request = serde_json::from_str(&row.request)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let response = row
            .response
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Task {
            id: row.id.into(),
            context_id: row.context_id,
            agent_id: row.agent_id.into(),
            channel_id: row.channel_id.map(Into::into),
            session_key: row.session_key,
            status,
            request,
            response,
            worker_id: row.worker_id,
            error: row.error,
            created_at,
            updated_at,
        })
    }
}

pub type SharedTaskStore = Arc<dyn TaskStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(id: &str) -> CreateTaskInput {
        CreateTaskInput {
            id: id.into(),
            context_id: "ctx-1".into(),
            agent_id: "worker-a".into(),
            channel_id: None,
            session_key: None,
            request: json!({"text": "do the thing"}),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = InMemoryTaskStore::new();
        store.create(input("task-1")).await.unwrap();
        let err = store.create(input("task-1")).await.unwrap_err();
        assert!(matches!(err, crate::Error::Store(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn valid_transition_chain_succeeds() {
        let store = InMemoryTaskStore::new();
        let task = store.create(input("task-1")).await.unwrap();

        store
            .update(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Working),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let done = store
            .update(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Completed),
                    response: Some(json!({"ok": true})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.response, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let store = InMemoryTaskStore::new();
        let task = store.create(input("task-1")).await.unwrap();

        let err = store
            .update(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::InputRequired),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Store(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn sqlite_create_and_update_round_trip() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteTaskStore::new(pool);
        store.migrate().await.unwrap();

        let task = store.create(input("task-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);

        let updated = store
            .update(
                &task.id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Working),
                    worker_id: Some("worker-proc-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Working);
        assert_eq!(updated.worker_id.as_deref(), Some("worker-proc-1"));
    }
}
