//! Channel records: membership, per-agent wake state, and the archive
//! protocol's scratchpad (spec.md §4.7).

use crate::error::{Result, StoreError};
use crate::{AgentId, AgentLoopState, ChannelId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    /// Mixed agent ids and human usernames.
    pub members: Vec<String>,
    pub agent_loop_states: HashMap<AgentId, AgentLoopState>,
    pub archived: bool,
    /// Members that have called `archive_ready` for the current archiving
    /// round; cleared on unarchive or once the channel actually archives.
    #[serde(default)]
    pub archive_ready_members: Vec<String>,
    /// Set when a non-forced archive request first moves the channel into
    /// the archiving state; cleared alongside `archive_ready_members`.
    #[serde(default)]
    pub archiving_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Members this channel tracks loop state for — the agent subset of
    /// `members`, as opposed to human participants.
    pub fn agent_members(&self) -> impl Iterator<Item = &String> {
        self.agent_loop_states
            .keys()
            .map(|id| id.as_ref())
            .filter(|id| self.members.iter().any(|m| m == id))
            .map(|id| self.members.iter().find(|m| m.as_str() == id).unwrap())
    }

    /// True once every agent member has called `archive_ready` for the
    /// current round (spec.md §4.7).
    pub fn archive_consensus_reached(&self) -> bool {
        let mut agents = self.agent_members().peekable();
        if agents.peek().is_none() {
            return false;
        }
        agents.all(|agent| self.archive_ready_members.iter().any(|m| m == agent))
    }
}

#[async_trait::async_trait]
pub trait ChannelStore: Send + Sync {
    async fn create(&self, id: ChannelId, name: String) -> Result<Channel>;
    async fn get(&self, id: &ChannelId) -> Result<Option<Channel>>;
    async fn add_member(&self, id: &ChannelId, member: String) -> Result<Channel>;
    async fn remove_member(&self, id: &ChannelId, member: &str) -> Result<Channel>;
    async fn set_loop_state(&self, id: &ChannelId, agent_id: AgentId, state: AgentLoopState) -> Result<Channel>;
    async fn set_archived(&self, id: &ChannelId, archived: bool) -> Result<Channel>;
    /// Move the channel into the archiving state, recording when the round
    /// started if it isn't already in progress. A no-op if already archived
    /// or already archiving.
    async fn enter_archiving(&self, id: &ChannelId) -> Result<Channel>;
    /// Record that `member` has called `archive_ready` for the current
    /// archiving round.
    async fn record_archive_ready(&self, id: &ChannelId, member: String) -> Result<Channel>;
    async fn list(&self) -> Result<Vec<Channel>>;
}

/// `DashMap`-backed in-memory channel store.
#[derive(Default)]
pub struct InMemoryChannelStore {
    channels: DashMap<ChannelId, Channel>,
}

impl InMemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate(&self, id: &ChannelId, f: impl FnOnce(&mut Channel)) -> Result<Channel> {
        let mut entry = self.channels.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "channel",
            id: id.to_string(),
        })?;
        f(&mut entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}

#[async_trait::async_trait]
impl ChannelStore for InMemoryChannelStore {
    async fn create(&self, id: ChannelId, name: String) -> Result<Channel> {
        if self.channels.contains_key(&id) {
            return Err(StoreError::AlreadyExists {
                entity: "channel",
                id: id.to_string(),
            }
            .into());
        }
        let now = Utc::now();
        let channel = Channel {
            id: id.clone(),
            name,
            members: Vec::new(),
            agent_loop_states: HashMap::new(),
            archived: false,
            archive_ready_members: Vec::new(),
            archiving_started_at: None,
            created_at: now,
            updated_at: now,
        };
        self.channels.insert(id, channel.clone());
        Ok(channel)
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<Channel>> {
        Ok(self.channels.get(id).map(|c| c.clone()))
    }

    async fn add_member(&self, id: &ChannelId, member: String) -> Result<Channel> {
        self.mutate(id, |channel| {
            if !channel.members.contains(&member) {
                channel.members.push(member);
            }
        })
    }

    async fn remove_member(&self, id: &ChannelId, member: &str) -> Result<Channel> {
        self.mutate(id, |channel| {
            channel.members.retain(|m| m != member);
            channel.agent_loop_states.remove(member);
        })
    }

    async fn set_loop_state(&self, id: &ChannelId, agent_id: AgentId, state: AgentLoopState) -> Result<Channel> {
        self.mutate(id, |channel| {
            channel.agent_loop_states.insert(agent_id, state);
        })
    }

    async fn set_archived(&self, id: &ChannelId, archived: bool) -> Result<Channel> {
        self.mutate(id, |channel| {
            channel.archived = archived;
            channel.archive_ready_members.clear();
            channel.archiving_started_at = None;
        })
    }

    async fn enter_archiving(&self, id: &ChannelId) -> Result<Channel> {
        self.mutate(id, |channel| {
            if !channel.archived && channel.archiving_started_at.is_none() {
                channel.archiving_started_at = Some(Utc::now());
            }
        })
    }

    async fn record_archive_ready(&self, id: &ChannelId, member: String) -> Result<Channel> {
        self.mutate(id, |channel| {
            if !channel.archive_ready_members.contains(&member) {
                channel.archive_ready_members.push(member);
            }
        })
    }

    async fn list(&self) -> Result<Vec<Channel>> {
        Ok(self.channels.iter().map(|c| c.clone()).collect())
    }
}

/// SQLite-backed channel store; `members`/`agent_loop_states` are stored as
/// JSON columns.
pub struct SqliteChannelStore {
    pool: SqlitePool,
}

impl SqliteChannelStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                members TEXT NOT NULL,
                agent_loop_states TEXT NOT NULL,
                archived INTEGER NOT NULL,
                archive_ready_members TEXT NOT NULL DEFAULT '[]',
                archiving_started_at TEXT,
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

    async fn fetch(&self, id: &ChannelId) -> Result<Channel> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "channel",
                id: id.to_string(),
            }
            .into())
    }

    async fn persist(&self, channel: &Channel) -> Result<()> {
        let members = serde_json::to_string(&channel.members).map_err(|e| StoreError::Query(e.to_string()))?;
        let states = serde_json::to_string(&channel.agent_loop_states)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let ready_members = serde_json::to_string(&channel.archive_ready_members)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE channels SET members = ?1, agent_loop_states = ?2, archived = ?3,
                archive_ready_members = ?4, archiving_started_at = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&members)
        .bind(&states)
        .bind(channel.archived as i64)
        .bind(&ready_members)
        .bind(channel.archiving_started_at.map(|t| t.to_rfc3339()))
        .bind(channel.updated_at.to_rfc3339())
        .bind(channel.id.as_ref())
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelStore for SqliteChannelStore {
    async fn create(&self, id: ChannelId, name: String) -> Result<Channel> {
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO channels (id, name, members, agent_loop_states, archived, archive_ready_members, archiving_started_at, created_at, updated_at)
            VALUES (?1, ?2, '[]', '{}', 0, '[]', NULL, ?3, ?3)
            "#,
        )
        .bind(id.as_ref())
        .bind(&name)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_error)) = &inserted {
            if db_error.code().as_deref() == Some("1555") || db_error.code().as_deref() == Some("2067") {
                return Err(StoreError::AlreadyExists {
                    entity: "channel",
                    id: id.to_string(),
                }
                .into());
            }
        }
        inserted.map_err(crate::Error::from)?;

        Ok(Channel {
            id,
            name,
            members: Vec::new(),
            agent_loop_states: HashMap::new(),
            archived: false,
            archive_ready_members: Vec::new(),
            archiving_started_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<Channel>> {
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name, members, agent_loop_states, archived, archive_ready_members, archiving_started_at, created_at, updated_at FROM channels WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn add_member(&self, id: &ChannelId, member: String) -> Result<Channel> {
        let mut channel = self.fetch(id).await?;
        if !channel.members.contains(&member) {
            channel.members.push(member);
        }
        channel.updated_at = Utc::now();
        self.persist(&channel).await?;
        Ok(channel)
    }

    async fn remove_member(&self, id: &ChannelId, member: &str) -> Result<Channel> {
        let mut channel = self.fetch(id).await?;
        channel.members.retain(|m| m != member);
        channel.agent_loop_states.remove(member);
        channel.updated_at = Utc::now();
        self.persist(&channel).await?;
        Ok(channel)
    }

    async fn set_loop_state(&self, id: &ChannelId, agent_id: AgentId, state: AgentLoopState) -> Result<Channel> {
        let mut channel = self.fetch(id).await?;
        channel.agent_loop_states.insert(agent_id, state);
        channel.updated_at = Utc::now();
        self.persist(&channel).await?;
        Ok(channel)
    }

    async fn set_archived(&self, id: &ChannelId, archived: bool) -> Result<Channel> {
        let mut channel = self.fetch(id).await?;
        channel.archived = archived;
        channel.archive_ready_members.clear();
        channel.archiving_started_at = None;
        channel.updated_at = Utc::now();
        self.persist(&channel).await?;
        Ok(channel)
    }

    async fn enter_archiving(&self, id: &ChannelId) -> Result<Channel> {
        let mut channel = self.fetch(id).await?;
        if !channel.archived && channel.archiving_started_at.is_none() {
            channel.archiving_started_at = Some(Utc::now());
        }
        channel.updated_at = Utc::now();
        self.persist(&channel).await?;
        Ok(channel)
    }

    async fn record_archive_ready(&self, id: &ChannelId, member: String) -> Result<Channel> {
        let mut channel = self.fetch(id).await?;
        if !channel.archive_ready_members.contains(&member) {
            channel.archive_ready_members.push(member);
        }
        channel.updated_at = Utc::now();
        self.persist(&channel).await?;
        Ok(channel)
    }

    async fn list(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name, members, agent_loop_states, archived, archive_ready_members, archiving_started_at, created_at, updated_at FROM channels",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ChannelRow {
    id: String,
    name: String,
    members: String,
    agent_loop_states: String,
    archived: i64,
    archive_ready_members: String,
    archiving_started_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = crate::Error;

    fn try_from(row: ChannelRow) -> std::result::Result<Self, Self::Error> {
        let members = serde_json::from_str(&row.members).map_err(|e| StoreError::Query(e.to_string()))?;
        let agent_loop_states =
            serde_json::from_str(&row.agent_loop_states).map_err(|e| StoreError::Query(e.to_string()))?;
        let archive_ready_members =
            serde_json::from_str(&row.archive_ready_members).map_err(|e| StoreError::Query(e.to_string()))?;
        let archiving_started_at = row
            .archiving_started_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| StoreError::Query(e.to_string()))
            })
            .transpose()?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Channel {
            id: row.id.into(),
            name: row.name,
            members,
            agent_loop_states,
            archived: row.archived != 0,
            archive_ready_members,
            archiving_started_at,
            created_at,
            updated_at,
        })
    }
}

pub type SharedChannelStore = Arc<dyn ChannelStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_member_is_idempotent() {
        let store = InMemoryChannelStore::new();
        let id: ChannelId = "chan-1".into();
        store.create(id.clone(), "General".into()).await.unwrap();
        store.add_member(&id, "worker-a".into()).await.unwrap();
        let channel = store.add_member(&id, "worker-a".into()).await.unwrap();
        assert_eq!(channel.members, vec!["worker-a".to_string()]);
    }

    #[tokio::test]
    async fn unarchive_clears_archive_ready_state() {
        let store = InMemoryChannelStore::new();
        let id: ChannelId = "chan-1".into();
        store.create(id.clone(), "General".into()).await.unwrap();
        store.enter_archiving(&id).await.unwrap();
        store.record_archive_ready(&id, "worker-a".into()).await.unwrap();
        store.set_archived(&id, true).await.unwrap();

        let channel = store.set_archived(&id, false).await.unwrap();
        assert!(!channel.archived);
        assert!(channel.archive_ready_members.is_empty());
        assert!(channel.archiving_started_at.is_none());
    }

    #[tokio::test]
    async fn archive_consensus_requires_every_agent_member() {
        let store = InMemoryChannelStore::new();
        let id: ChannelId = "chan-1".into();
        store.create(id.clone(), "General".into()).await.unwrap();
        store.add_member(&id, "pm".into()).await.unwrap();
        store.add_member(&id, "coder".into()).await.unwrap();
        store.set_loop_state(&id, "pm".into(), AgentLoopState::Awake).await.unwrap();
        store.set_loop_state(&id, "coder".into(), AgentLoopState::Awake).await.unwrap();

        let channel = store.record_archive_ready(&id, "pm".into()).await.unwrap();
        assert!(!channel.archive_consensus_reached());

        let channel = store.record_archive_ready(&id, "coder".into()).await.unwrap();
        assert!(channel.archive_consensus_reached());
    }

    #[tokio::test]
    async fn sqlite_round_trips_members_and_loop_state() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteChannelStore::new(pool);
        store.migrate().await.unwrap();

        let id: ChannelId = "chan-1".into();
        store.create(id.clone(), "General".into()).await.unwrap();
        store.add_member(&id, "worker-a".into()).await.unwrap();
        store
            .set_loop_state(&id, "worker-a".into(), AgentLoopState::Awake)
            .await
            .unwrap();

        let channel = store.get(&id).await.unwrap().unwrap();
        assert_eq!(channel.members, vec!["worker-a".to_string()]);
        assert_eq!(
            channel.agent_loop_states.get("worker-a").copied(),
            Some(AgentLoopState::Awake)
        );
    }
}
