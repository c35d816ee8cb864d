//! External platform bridges: mapping a Flock channel to a conversation on
//! an external platform, at most one active bridge per (platform, external
//! channel) pair (spec.md §4.7).

use crate::error::{Result, StoreError};
use crate::{BridgeId, ChannelId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bridge {
    pub id: BridgeId,
    pub channel_id: ChannelId,
    pub platform: String,
    pub external_channel_id: String,
    pub webhook_url: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait BridgeStore: Send + Sync {
    async fn create(
        &self,
        id: BridgeId,
        channel_id: ChannelId,
        platform: String,
        external_channel_id: String,
        webhook_url: Option<String>,
    ) -> Result<Bridge>;

    async fn get(&self, id: &BridgeId) -> Result<Option<Bridge>>;
    async fn get_by_channel(&self, channel_id: &ChannelId) -> Result<Option<Bridge>>;
    async fn get_active_by_external(&self, platform: &str, external_channel_id: &str) -> Result<Option<Bridge>>;
    async fn deactivate(&self, id: &BridgeId) -> Result<Bridge>;
}

/// `DashMap`-backed bridge store enforcing the at-most-one-active invariant
/// at insert time.
#[derive(Default)]
pub struct InMemoryBridgeStore {
    bridges: DashMap<BridgeId, Bridge>,
}

impl InMemoryBridgeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BridgeStore for InMemoryBridgeStore {
    async fn create(
        &self,
        id: BridgeId,
        channel_id: ChannelId,
        platform: String,
        external_channel_id: String,
        webhook_url: Option<String>,
    ) -> Result<Bridge> {
        let already_active = self
            .bridges
            .iter()
            .any(|b| b.active && b.platform == platform && b.external_channel_id == external_channel_id);
        if already_active {
            return Err(StoreError::AlreadyExists {
                entity: "bridge",
                id: format!("{platform}:{external_channel_id}"),
            }
            .into());
        }

        let bridge = Bridge {
            id: id.clone(),
            channel_id,
            platform,
            external_channel_id,
            webhook_url,
            active: true,
            created_at: Utc::now(),
        };
        self.bridges.insert(id, bridge.clone());
        Ok(bridge)
    }

    async fn get(&self, id: &BridgeId) -> Result<Option<Bridge>> {
        Ok(self.bridges.get(id).map(|b| b.clone()))
    }

    async fn get_by_channel(&self, channel_id: &ChannelId) -> Result<Option<Bridge>> {
        Ok(self
            .bridges
            .iter()
            .find(|b| b.active && b.channel_id == *channel_id)
            .map(|b| b.clone()))
    }

    async fn get_active_by_external(&self, platform: &str, external_channel_id: &str) -> Result<Option<Bridge>> {
        Ok(self
            .bridges
            .iter()
            .find(|b| b.active && b.platform == platform && b.external_channel_id == external_channel_id)
            .map(|b| b.clone()))
    }

    async fn deactivate(&self, id: &BridgeId) -> Result<Bridge> {
        let mut entry = self.bridges.get_mut(id).ok_or_else(|| StoreError::NotFound {
            entity: "bridge",
            id: id.to_string(),
        })?;
        entry.active = false;
        Ok(entry.clone())
    }
}

/// SQLite-backed bridge store; the active-uniqueness invariant is enforced
/// with a partial unique index.
pub struct SqliteBridgeStore {
    pool: SqlitePool,
}

impl SqliteBridgeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridges (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                external_channel_id TEXT NOT NULL,
                webhook_url TEXT,
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS bridges_active_external
            ON bridges (platform, external_channel_id)
            WHERE active = 1
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BridgeStore for SqliteBridgeStore {
    async fn create(
        &self,
        id: BridgeId,
        channel_id: ChannelId,
        platform: String,
        external_channel_id: String,
        webhook_url: Option<String>,
    ) -> Result<Bridge> {
        let created_at = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO bridges (id, channel_id, platform, external_channel_id, webhook_url, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
            "#,
        )
        .bind(id.as_ref())
        .bind(channel_id.as_ref())
        .bind(&platform)
        .bind(&external_channel_id)
        .bind(&webhook_url)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_error)) = &inserted {
            if db_error.is_unique_violation() {
                return Err(StoreError::AlreadyExists {
                    entity: "bridge",
                    id: format!("{platform}:{external_channel_id}"),
                }
                .into());
            }
        }
        inserted.map_err(crate::Error::from)?;

        Ok(Bridge {
            id,
            channel_id,
            platform,
            external_channel_id,
            webhook_url,
            active: true,
            created_at,
        })
    }

    async fn get(&self, id: &BridgeId) -> Result<Option<Bridge>> {
        let row = sqlx::query_as::<_, BridgeRow>(
            "SELECT id, channel_id, platform, external_channel_id, webhook_url, active, created_at FROM bridges WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_channel(&self, channel_id: &ChannelId) -> Result<Option<Bridge>> {
        let row = sqlx::query_as::<_, BridgeRow>(
            "SELECT id, channel_id, platform, external_channel_id, webhook_url, active, created_at FROM bridges WHERE channel_id = ?1 AND active = 1",
        )
        .bind(channel_id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_active_by_external(&self, platform: &str, external_channel_id: &str) -> Result<Option<Bridge>> {
        let row = sqlx::query_as::<_, BridgeRow>(
            "SELECT id, channel_id, platform, external_channel_id, webhook_url, active, created_at FROM bridges WHERE platform = ?1 AND external_channel_id = ?2 AND active = 1",
        )
        .bind(platform)
        .bind(external_channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn deactivate(&self, id: &BridgeId) -> Result<Bridge> {
        sqlx::query("UPDATE bridges SET active = 0 WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await
            .map_err(crate::Error::from)?;

        self.get(id).await?.ok_or_else(|| {
            StoreError::NotFound {
                entity: "bridge",
                id: id.to_string(),
            }
            .into()
        })
    }
}

#[derive(sqlx::FromRow)]
struct BridgeRow {
    id: String,
    channel_id: String,
    platform: String,
    external_channel_id: String,
    webhook_url: Option<String>,
    active: i64,
    created_at: String,
}

impl TryFrom<BridgeRow> for Bridge {
    type Error = crate::Error;

    fn try_from(row: BridgeRow) -> std::result::Result<Self, Self::Error> {
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        Ok(Bridge {
            id: row.id.into(),
            channel_id: row.channel_id.into(),
            platform: row.platform,
            external_channel_id: row.external_channel_id,
            webhook_url: row.webhook_url,
            active: row.active != 0,
            created_at,
        })
    }
}

pub type SharedBridgeStore = Arc<dyn BridgeStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cannot_create_second_active_bridge_for_same_external_channel() {
        let store = InMemoryBridgeStore::new();
        store
            .create("bridge-1".into(), "chan-1".into(), "discord".into(), "ext-1".into(), None)
            .await
            .unwrap();

        let err = store
            .create("bridge-2".into(), "chan-2".into(), "discord".into(), "ext-1".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Store(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn deactivate_allows_new_bridge_for_same_external_channel() {
        let store = InMemoryBridgeStore::new();
        store
            .create("bridge-1".into(), "chan-1".into(), "discord".into(), "ext-1".into(), None)
            .await
            .unwrap();
        store.deactivate(&"bridge-1".into()).await.unwrap();

        let recreated = store
            .create("bridge-2".into(), "chan-2".into(), "discord".into(), "ext-1".into(), None)
            .await
            .unwrap();
        assert!(recreated.active);
    }
}
