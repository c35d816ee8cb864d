//! Agent-to-node assignment records: the durable record of where an agent's
//! portable working state currently lives (spec.md §3, §4.4).

use crate::error::{Result, StoreError};
use crate::{AgentId, NodeId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

/// An agent's current node assignment. Exactly one assignment exists per
/// agent at any time (spec.md §3 "exactly-one-node invariant").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub portable_path: String,
    pub assigned_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Insert or overwrite the assignment for `agent_id`.
    async fn assign(&self, agent_id: AgentId, node_id: NodeId, portable_path: String)
        -> Result<Assignment>;

    async fn get(&self, agent_id: &AgentId) -> Result<Option<Assignment>>;

    async fn remove(&self, agent_id: &AgentId) -> Result<()>;

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<Assignment>>;
}

/// `DashMap`-backed assignment store.
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    assignments: DashMap<AgentId, Assignment>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn assign(
        &self,
        agent_id: AgentId,
        node_id: NodeId,
        portable_path: String,
    ) -> Result<Assignment> {
        let assignment = Assignment {
            agent_id: agent_id.clone(),
            node_id,
            portable_path,
            assigned_at: Utc::now(),
        };
        self.assignments.insert(agent_id, assignment.clone());
        Ok(assignment)
    }

    async fn get(&self, agent_id: &AgentId) -> Result<Option<Assignment>> {
        Ok(self.assignments.get(agent_id).map(|a| a.clone()))
    }

    async fn remove(&self, agent_id: &AgentId) -> Result<()> {
        self.assignments.remove(agent_id);
        Ok(())
    }

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<Assignment>> {
        Ok(self
            .assignments
            .iter()
            .filter(|a| a.node_id == *node_id)
            .map(|a| a.clone())
            .collect())
    }
}

/// SQLite-backed assignment store; `agent_id` is the primary key so
/// `assign()` naturally overwrites any prior row.
pub struct SqliteAssignmentStore {
    pool: SqlitePool,
}

impl SqliteAssignmentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assignments (
                agent_id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                portable_path TEXT NOT NULL,
                assigned_at TEXT NOT NULL
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
impl AssignmentStore for SqliteAssignmentStore {
    async fn assign(
        &self,
        agent_id: AgentId,
        node_id: NodeId,
        portable_path: String,
    ) -> Result<Assignment> {
        let assigned_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO assignments (agent_id, node_id, portable_path, assigned_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(agent_id) DO UPDATE SET
                node_id = excluded.node_id,
                portable_path = excluded.portable_path,
                assigned_at = excluded.assigned_at
            "#,
        )
        .bind(agent_id.as_ref())
        .bind(node_id.as_ref())
        .bind(&portable_path)
        .bind(assigned_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        Ok(Assignment {
            agent_id,
            node_id,
            portable_path,
            assigned_at,
        })
    }

    async fn get(&self, agent_id: &AgentId) -> Result<Option<Assignment>> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            "SELECT agent_id, node_id, portable_path, assigned_at FROM assignments WHERE agent_id = ?1",
        )
        .bind(agent_id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn remove(&self, agent_id: &AgentId) -> Result<()> {
        sqlx::query("DELETE FROM assignments WHERE agent_id = ?1")
            .bind(agent_id.as_ref())
            .execute(&self.pool)
            .await
            .map_err(crate::Error::from)?;
        Ok(())
    }

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<Assignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "SELECT agent_id, node_id, portable_path, assigned_at FROM assignments WHERE node_id = ?1",
        )
        .bind(node_id.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    agent_id: String,
    node_id: String,
    portable_path: String,
    assigned_at: String,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = crate::Error;

    fn try_from(row: AssignmentRow) -> std::result::Result<Self, Self::Error> {
        let assigned_at = DateTime::parse_from_rfc3339(&row.assigned_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        Ok(Assignment {
            agent_id: row.agent_id.into(),
            node_id: row.node_id.into(),
            portable_path: row.portable_path,
            assigned_at,
        })
    }
}

pub type SharedAssignmentStore = Arc<dyn AssignmentStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assign_overwrites_prior_assignment() {
        let store = InMemoryAssignmentStore::new();
        let agent_id: AgentId = "worker-a".into();
        store
            .assign(agent_id.clone(), "node-1".into(), "/portable/a".into())
            .await
            .unwrap();
        store
            .assign(agent_id.clone(), "node-2".into(), "/portable/a".into())
            .await
            .unwrap();

        let current = store.get(&agent_id).await.unwrap().unwrap();
        assert_eq!(current.node_id.as_ref(), "node-2");

        let on_node_1 = store.list_by_node(&"node-1".into()).await.unwrap();
        assert!(on_node_1.is_empty());
    }

    #[tokio::test]
    async fn sqlite_assign_is_upsert() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteAssignmentStore::new(pool);
        store.migrate().await.unwrap();

        let agent_id: AgentId = "worker-a".into();
        store
            .assign(agent_id.clone(), "node-1".into(), "/portable/a".into())
            .await
            .unwrap();
        store
            .assign(agent_id.clone(), "node-2".into(), "/portable/a".into())
            .await
            .unwrap();

        let current = store.get(&agent_id).await.unwrap().unwrap();
        assert_eq!(current.node_id.as_ref(), "node-2");
    }
}
