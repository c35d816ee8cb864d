//! Channel message log: strictly monotonic, gap-free sequence numbers
//! starting at 1 (spec.md §4.7, Testable Property 6).

use crate::error::{Result, StoreError};
use crate::ChannelId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel_id: ChannelId,
    pub seq: u64,
    pub sender: String,
    pub text: String,
    pub echo_of: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait ChannelMessageStore: Send + Sync {
    /// Append a message, assigning the next sequence number for the channel.
    async fn append(&self, channel_id: &ChannelId, sender: String, text: String, echo_of: Option<String>)
        -> Result<ChannelMessage>;

    async fn list_since(&self, channel_id: &ChannelId, since_seq: u64) -> Result<Vec<ChannelMessage>>;

    async fn latest_seq(&self, channel_id: &ChannelId) -> Result<u64>;
}

/// In-memory message log. A per-channel mutex serializes sequence
/// assignment so concurrent appends never skip or collide (spec.md §4.7).
#[derive(Default)]
pub struct InMemoryChannelMessageStore {
    channels: DashMap<ChannelId, Arc<Mutex<Vec<ChannelMessage>>>>,
}

impl InMemoryChannelMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_log(&self, channel_id: &ChannelId) -> Arc<Mutex<Vec<ChannelMessage>>> {
        self.channels
            .entry(channel_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }
}

#[async_trait::async_trait]
impl ChannelMessageStore for InMemoryChannelMessageStore {
    async fn append(
        &self,
        channel_id: &ChannelId,
        sender: String,
        text: String,
        echo_of: Option<String>,
    ) -> Result<ChannelMessage> {
        let log = self.channel_log(channel_id);
        let mut guard = log.lock();
        let seq = guard.len() as u64 + 1;
        let message = ChannelMessage {
            channel_id: channel_id.clone(),
            seq,
            sender,
            text,
            echo_of,
            created_at: Utc::now(),
        };
        guard.push(message.clone());
        Ok(message)
    }

    async fn list_since(&self, channel_id: &ChannelId, since_seq: u64) -> Result<Vec<ChannelMessage>> {
        let log = self.channel_log(channel_id);
        let guard = log.lock();
        Ok(guard.iter().filter(|m| m.seq > since_seq).cloned().collect())
    }

    async fn latest_seq(&self, channel_id: &ChannelId) -> Result<u64> {
        let log = self.channel_log(channel_id);
        let guard = log.lock();
        Ok(guard.len() as u64)
    }
}

/// SQLite-backed message log. Sequence assignment uses a transaction that
/// reads `MAX(seq)` and inserts under the same connection, matching the
/// teacher's retry-on-conflict pattern for compound writes.
pub struct SqliteChannelMessageStore {
    pool: SqlitePool,
}

impl SqliteChannelMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_messages (
                channel_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                echo_of TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (channel_id, seq)
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
impl ChannelMessageStore for SqliteChannelMessageStore {
    async fn append(
        &self,
        channel_id: &ChannelId,
        sender: String,
        text: String,
        echo_of: Option<String>,
    ) -> Result<ChannelMessage> {
        let mut tx = self.pool.begin().await.map_err(crate::Error::from)?;

        let current_max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(seq) FROM channel_messages WHERE channel_id = ?1",
        )
        .bind(channel_id.as_ref())
        .fetch_one(&mut *tx)
        .await
        .map_err(crate::Error::from)?;

        let seq = current_max.unwrap_or(0) as u64 + 1;
        let created_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO channel_messages (channel_id, seq, sender, text, echo_of, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(channel_id.as_ref())
        .bind(seq as i64)
        .bind(&sender)
        .bind(&text)
        .bind(&echo_of)
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(crate::Error::from)?;

        tx.commit().await.map_err(crate::Error::from)?;

        Ok(ChannelMessage {
            channel_id: channel_id.clone(),
            seq,
            sender,
            text,
            echo_of,
            created_at,
        })
    }

    async fn list_since(&self, channel_id: &ChannelId, since_seq: u64) -> Result<Vec<ChannelMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT channel_id, seq, sender, text, echo_of, created_at FROM channel_messages
            WHERE channel_id = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(channel_id.as_ref())
        .bind(since_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn latest_seq(&self, channel_id: &ChannelId) -> Result<u64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(seq) FROM channel_messages WHERE channel_id = ?1",
        )
        .bind(channel_id.as_ref())
        .fetch_one(&self.pool)
        .await
        .map_err(crate::Error::from)?;
        Ok(max.unwrap_or(0) as u64)
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    channel_id: String,
    seq: i64,
    sender: String,
    text: String,
    echo_of: Option<String>,
    created_at: String,
}

impl TryFrom<MessageRow> for ChannelMessage {
    type Error = crate::Error;

    fn try_from(row: MessageRow) -> std::result::Result<Self, Self::Error> {
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        Ok(ChannelMessage {
            channel_id: row.channel_id.into(),
            seq: row.seq as u64,
            sender: row.sender,
            text: row.text,
            echo_of: row.echo_of,
            created_at,
        })
    }
}

pub type SharedChannelMessageStore = Arc<dyn ChannelMessageStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_are_gap_free_and_start_at_one() {
        let store = InMemoryChannelMessageStore::new();
        let channel_id: ChannelId = "chan-1".into();
        let first = store.append(&channel_id, "worker-a".into(), "hi".into(), None).await.unwrap();
        let second = store.append(&channel_id, "worker-b".into(), "hello".into(), None).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn list_since_returns_only_later_messages() {
        let store = InMemoryChannelMessageStore::new();
        let channel_id: ChannelId = "chan-1".into();
        for i in 0..3 {
            store
                .append(&channel_id, "worker-a".into(), format!("msg {i}"), None)
                .await
                .unwrap();
        }
        let tail = store.list_since(&channel_id, 1).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 2);
    }

    #[tokio::test]
    async fn sqlite_sequence_numbers_are_gap_free() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = SqliteChannelMessageStore::new(pool);
        store.migrate().await.unwrap();

        let channel_id: ChannelId = "chan-1".into();
        let first = store.append(&channel_id, "worker-a".into(), "hi".into(), None).await.unwrap();
        let second = store.append(&channel_id, "worker-b".into(), "hello".into(), None).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }
}
