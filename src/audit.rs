//! Append-only audit log: every transport/agent/migration/bridge boundary
//! records a `GREEN`/`YELLOW`/`RED` entry here (spec.md §4.1, §7).

use crate::error::{Result, StoreError};
use crate::AuditLevel;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub home_id: Option<String>,
    pub agent_id: Option<String>,
    pub action: String,
    pub level: AuditLevel,
    pub detail: String,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Fields needed to append a new entry; `id`/`timestamp` are assigned by the
/// store.
#[derive(Debug, Clone, Default)]
pub struct NewAuditEntry {
    pub home_id: Option<String>,
    pub agent_id: Option<String>,
    pub action: String,
    pub level: AuditLevel,
    pub detail: String,
    pub result: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Filters for listing entries; every field is an AND-conjoined, optional
/// restriction.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub agent_id: Option<String>,
    pub level: Option<AuditLevel>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry>;
    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>>;
}

/// `DashMap`-backed in-memory audit log for single-process/testing nodes.
pub struct InMemoryAuditLog {
    entries: DashMap<u64, AuditEntry>,
    next_id: AtomicU64,
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait::async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let full = AuditEntry {
            id,
            timestamp: Utc::now(),
            home_id: entry.home_id,
            agent_id: entry.agent_id,
            action: entry.action,
            level: entry.level,
            detail: entry.detail,
            result: entry.result,
            duration_ms: entry.duration_ms,
        };
        self.entries.insert(id, full.clone());
        Ok(full)
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut results: Vec<AuditEntry> = self
            .entries
            .iter()
            .map(|e| e.clone())
            .filter(|entry| {
                query
                    .agent_id
                    .as_ref()
                    .is_none_or(|id| entry.agent_id.as_deref() == Some(id.as_str()))
            })
            .filter(|entry| query.level.is_none_or(|level| entry.level == level))
            .filter(|entry| query.since.is_none_or(|since| entry.timestamp >= since))
            .collect();
        results.sort_by_key(|entry| entry.id);
        if let Some(limit) = query.limit {
            results.truncate(limit as usize);
        }
        Ok(results)
    }
}

/// SQLite-backed audit log for durable nodes.
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                home_id TEXT,
                agent_id TEXT,
                action TEXT NOT NULL,
                level TEXT NOT NULL,
                detail TEXT NOT NULL,
                result TEXT,
                duration_ms INTEGER
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
impl AuditLog for SqliteAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let timestamp = Utc::now();
        let level = entry.level.as_str();
        let row = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO audit_log (timestamp, home_id, agent_id, action, level, detail, result, duration_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING id
            "#,
        )
        .bind(timestamp.to_rfc3339())
        .bind(&entry.home_id)
        .bind(&entry.agent_id)
        .bind(&entry.action)
        .bind(level)
        .bind(&entry.detail)
        .bind(&entry.result)
        .bind(entry.duration_ms.map(|v| v as i64))
        .fetch_one(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        Ok(AuditEntry {
            id: row.0 as u64,
            timestamp,
            home_id: entry.home_id,
            agent_id: entry.agent_id,
            action: entry.action,
            level: entry.level,
            detail: entry.detail,
            result: entry.result,
            duration_ms: entry.duration_ms,
        })
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        let limit = query.limit.unwrap_or(1000) as i64;
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, timestamp, home_id, agent_id, action, level, detail, result, duration_ms
            FROM audit_log
            WHERE (?1 IS NULL OR agent_id = ?1)
              AND (?2 IS NULL OR level = ?2)
              AND (?3 IS NULL OR timestamp >= ?3)
            ORDER BY id ASC
            LIMIT ?4
            "#,
        )
        .bind(&query.agent_id)
        .bind(query.level.map(|l| l.as_str()))
        .bind(query.since.map(|s| s.to_rfc3339()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    timestamp: String,
    home_id: Option<String>,
    agent_id: Option<String>,
    action: String,
    level: String,
    detail: String,
    result: Option<String>,
    duration_ms: Option<i64>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = crate::Error;

    fn try_from(row: AuditRow) -> std::result::Result<Self, Self::Error> {
        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        let level = AuditLevel::parse(&row.level)
            .ok_or_else(|| StoreError::Query(format!("unknown audit level {}", row.level)))?;
        Ok(AuditEntry {
            id: row.id as u64,
            timestamp,
            home_id: row.home_id,
            agent_id: row.agent_id,
            action: row.action,
            level,
            detail: row.detail,
            result: row.result,
            duration_ms: row.duration_ms.map(|v| v as u64),
        })
    }
}

pub type SharedAuditLog = Arc<dyn AuditLog>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(agent_id: &str, level: AuditLevel) -> NewAuditEntry {
        NewAuditEntry {
            home_id: Some(format!("{agent_id}@node-1")),
            agent_id: Some(agent_id.to_string()),
            action: "dispatch".into(),
            level,
            detail: "test entry".into(),
            result: None,
            duration_ms: Some(12),
        }
    }

    #[tokio::test]
    async fn in_memory_append_and_query_by_level() {
        let log = InMemoryAuditLog::new();
        log.append(entry("worker-a", AuditLevel::Green)).await.unwrap();
        log.append(entry("worker-b", AuditLevel::Red)).await.unwrap();

        let red_only = log
            .query(AuditQuery {
                level: Some(AuditLevel::Red),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(red_only.len(), 1);
        assert_eq!(red_only[0].agent_id.as_deref(), Some("worker-b"));
    }

    #[tokio::test]
    async fn in_memory_query_respects_limit_and_order() {
        let log = InMemoryAuditLog::new();
        for _ in 0..5 {
            log.append(entry("worker-a", AuditLevel::Green)).await.unwrap();
        }
        let limited = log
            .query(AuditQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, 1);
        assert_eq!(limited[1].id, 2);
    }

    #[tokio::test]
    async fn sqlite_append_and_query_round_trips() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let log = SqliteAuditLog::new(pool);
        log.migrate().await.unwrap();

        log.append(entry("worker-a", AuditLevel::Yellow)).await.unwrap();
        let results = log.query(AuditQuery::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].level, AuditLevel::Yellow);
        assert_eq!(results[0].detail, "test entry");
    }
}
