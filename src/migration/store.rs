//! Migration ticket storage. Phase and ownership are updated together as one
//! atomic compound write (spec.md §4.4.3) — never phase alone, never
//! ownership alone.

use crate::error::{Result, StoreError};
use crate::migration::ticket::{MigrationTicket, OwnershipHolder, Phase};
use crate::{AgentId, MigrationId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::sync::Arc;

/// A compound update applied atomically to a ticket.
#[derive(Debug, Clone, Default)]
pub struct TicketUpdate {
    pub phase: Option<Phase>,
    pub ownership: Option<OwnershipHolder>,
    pub portable_path: Option<String>,
    pub archive_checksum: Option<String>,
    pub archive_size_bytes: Option<u64>,
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait TicketStore: Send + Sync {
    async fn create(&self, ticket: MigrationTicket) -> Result<MigrationTicket>;
    async fn get(&self, id: &MigrationId) -> Result<Option<MigrationTicket>>;
    async fn get_active_for_agent(&self, agent_id: &AgentId) -> Result<Option<MigrationTicket>>;
    async fn apply(&self, id: &MigrationId, update: TicketUpdate) -> Result<MigrationTicket>;
}

/// In-memory ticket store. Each ticket is behind its own `parking_lot::Mutex`
/// so a compound phase+ownership write can never be observed half-applied,
/// without serializing unrelated tickets behind one global lock.
#[derive(Default)]
pub struct InMemoryTicketStore {
    tickets: DashMap<MigrationId, Arc<Mutex<MigrationTicket>>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn create(&self, ticket: MigrationTicket) -> Result<MigrationTicket> {
        if let Some(existing) = self.get_active_for_agent(&ticket.agent_id).await? {
            return Err(StoreError::AlreadyExists {
                entity: "migration_ticket",
                id: existing.id.to_string(),
            }
            .into());
        }
        let id = ticket.id.clone();
        let value = ticket.clone();
        self.tickets.insert(id, Arc::new(Mutex::new(value)));
        Ok(ticket)
    }

    async fn get(&self, id: &MigrationId) -> Result<Option<MigrationTicket>> {
        Ok(self.tickets.get(id).map(|t| t.lock().clone()))
    }

    async fn get_active_for_agent(&self, agent_id: &AgentId) -> Result<Option<MigrationTicket>> {
        Ok(self.tickets.iter().find_map(|entry| {
            let ticket = entry.lock();
            if ticket.agent_id == *agent_id && !ticket.phase.is_terminal() {
                Some(ticket.clone())
            } else {
                None
            }
        }))
    }

    async fn apply(&self, id: &MigrationId, update: TicketUpdate) -> Result<MigrationTicket> {
        let entry = self.tickets.get(id).ok_or_else(|| StoreError::NotFound {
            entity: "migration_ticket",
            id: id.to_string(),
        })?;
        let mut ticket = entry.lock();
        if let Some(phase) = update.phase {
            ticket.phase = phase;
        }
        if let Some(ownership) = update.ownership {
            ticket.ownership = ownership;
        }
        if let Some(portable_path) = update.portable_path {
            ticket.portable_path = Some(portable_path);
        }
        if let Some(checksum) = update.archive_checksum {
            ticket.archive_checksum = Some(checksum);
        }
        if let Some(size) = update.archive_size_bytes {
            ticket.archive_size_bytes = Some(size);
        }
        if let Some(error) = update.error {
            ticket.error = Some(error);
        }
        ticket.updated_at = Utc::now();
        Ok(ticket.clone())
    }
}

/// SQLite-backed ticket store. `apply` issues one `UPDATE` touching every
/// compound field at once so phase and ownership can never diverge under
/// concurrent writers (enforced by SQLite's own serialized writer, not an
/// app-level lock).
pub struct SqliteTicketStore {
    pool: SqlitePool,
}

impl SqliteTicketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migration_tickets (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                source_node TEXT NOT NULL,
                target_node TEXT NOT NULL,
                phase TEXT NOT NULL,
                ownership TEXT NOT NULL,
                portable_path TEXT,
                archive_checksum TEXT,
                archive_size_bytes INTEGER,
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
impl TicketStore for SqliteTicketStore {
    async fn create(&self, ticket: MigrationTicket) -> Result<MigrationTicket> {
        if let Some(existing) = self.get_active_for_agent(&ticket.agent_id).await? {
            return Err(StoreError::AlreadyExists {
                entity: "migration_ticket",
                id: existing.id.to_string(),
            }
            .into());
        }

        sqlx::query(
            r#"
            INSERT INTO migration_tickets
                (id, agent_id, source_node, target_node, phase, ownership, portable_path, archive_checksum, archive_size_bytes, error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            "#,
        )
        .bind(ticket.id.as_ref())
        .bind(ticket.agent_id.as_ref())
        .bind(ticket.source_node.as_ref())
        .bind(ticket.target_node.as_ref())
        .bind(ticket.phase.as_str())
        .bind(ownership_str(ticket.ownership))
        .bind(&ticket.portable_path)
        .bind(&ticket.archive_checksum)
        .bind(ticket.archive_size_bytes.map(|v| v as i64))
        .bind(&ticket.error)
        .bind(ticket.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        Ok(ticket)
    }

    async fn get(&self, id: &MigrationId) -> Result<Option<MigrationTicket>> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT id, agent_id, source_node, target_node, phase, ownership, portable_path,
                   archive_checksum, archive_size_bytes, error, created_at, updated_at
            FROM migration_tickets WHERE id = ?1
            "#,
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn get_active_for_agent(&self, agent_id: &AgentId) -> Result<Option<MigrationTicket>> {
        let row = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT id, agent_id, source_node, target_node, phase, ownership, portable_path,
                   archive_checksum, archive_size_bytes, error, created_at, updated_at
            FROM migration_tickets
            WHERE agent_id = ?1 AND phase NOT IN ('COMPLETED', 'ABORTED')
            "#,
        )
        .bind(agent_id.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn apply(&self, id: &MigrationId, update: TicketUpdate) -> Result<MigrationTicket> {
        let mut current = self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "migration_ticket",
            id: id.to_string(),
        })?;

        if let Some(phase) = update.phase {
            current.phase = phase;
        }
        if let Some(ownership) = update.ownership {
            current.ownership = ownership;
        }
        if let Some(portable_path) = update.portable_path {
            current.portable_path = Some(portable_path);
        }
        if let Some(checksum) = update.archive_checksum {
            current.archive_checksum = Some(checksum);
        }
        if let Some(size) = update.archive_size_bytes {
            current.archive_size_bytes = Some(size);
        }
        if let Some(error) = update.error {
            current.error = Some(error);
        }
        current.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE migration_tickets SET
                phase = ?1, ownership = ?2, portable_path = ?3, archive_checksum = ?4,
                archive_size_bytes = ?5, error = ?6, updated_at = ?7
            WHERE id = ?8
            "#,
        )
        .bind(current.phase.as_str())
        .bind(ownership_str(current.ownership))
        .bind(&current.portable_path)
        .bind(&current.archive_checksum)
        .bind(current.archive_size_bytes.map(|v| v as i64))
        .bind(&current.error)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await
        .map_err(crate::Error::from)?;

        Ok(current)
    }
}

fn ownership_str(ownership: OwnershipHolder) -> &'static str {
    match ownership {
        OwnershipHolder::Source => "source",
        OwnershipHolder::Target => "target",
    }
}

fn parse_phase(value: &str) -> Option<Phase> {
    use Phase::*;
    Some(match value {
        "REQUESTED" => Requested,
        "AUTHORIZED" => Authorized,
        "FREEZING" => Freezing,
        "FROZEN" => Frozen,
        "SNAPSHOTTING" => Snapshotting,
        "TRANSFERRING" => Transferring,
        "VERIFYING" => Verifying,
        "REHYDRATING" => Rehydrating,
        "FINALIZING" => Finalizing,
        "COMPLETED" => Completed,
        "ROLLING_BACK" => RollingBack,
        "ABORTED" => Aborted,
        _ => return None,
    })
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: String,
    agent_id: String,
    source_node: String,
    target_node: String,
    phase: String,
    ownership: String,
    portable_path: Option<String>,
    archive_checksum: Option<String>,
    archive_size_bytes: Option<i64>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TicketRow> for MigrationTicket {
    type Error = crate::Error;

    fn try_from(row: TicketRow) -> std::result::Result<Self, Self::Error> {
        let phase = parse_phase(&row.phase)
            .ok_or_else(|| StoreError::Query(format!("unknown migration phase {}", row.phase)))?;
        let ownership = match row.ownership.as_str() {
            "source" => OwnershipHolder::Source,
            "target" => OwnershipHolder::Target,
            other => return Err(StoreError::Query(format!("unknown ownership {other}")).into()),
        };
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| StoreError::Query(e.to_string()))?
            .with_timezone(&Utc);

        Ok(MigrationTicket {
            id: row.id.into(),
            agent_id: row.agent_id.into(),
            source_node: row.source_node.into(),
            target_node: row.target_node.into(),
            phase,
            ownership,
            portable_path: row.portable_path,
            archive_checksum: row.archive_checksum,
            archive_size_bytes: row.archive_size_bytes.map(|v| v as u64),
            error: row.error,
            created_at,
            updated_at,
        })
    }
}

pub type SharedTicketStore = Arc<dyn TicketStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_active_ticket_for_same_agent_is_rejected() {
        let store = InMemoryTicketStore::new();
        let ticket = MigrationTicket::new("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into());
        store.create(ticket).await.unwrap();

        let second = MigrationTicket::new("mig-2".into(), "worker-a".into(), "node-1".into(), "node-3".into());
        let err = store.create(second).await.unwrap_err();
        assert!(matches!(err, crate::Error::Store(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn apply_updates_phase_and_ownership_together() {
        let store = InMemoryTicketStore::new();
        let ticket = MigrationTicket::new("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into());
        store.create(ticket).await.unwrap();

        let updated = store
            .apply(
                &"mig-1".into(),
                TicketUpdate {
                    phase: Some(Phase::Verifying),
                    ownership: Some(OwnershipHolder::Target),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.phase, Phase::Verifying);
        assert_eq!(updated.ownership, OwnershipHolder::Target);
    }

    #[tokio::test]
    async fn completed_ticket_does_not_block_new_migration() {
        let store = InMemoryTicketStore::new();
        let ticket = MigrationTicket::new("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into());
        store.create(ticket).await.unwrap();
        store
            .apply(&"mig-1".into(), TicketUpdate { phase: Some(Phase::Completed), ..Default::default() })
            .await
            .unwrap();

        let second = MigrationTicket::new("mig-2".into(), "worker-a".into(), "node-2".into(), "node-3".into());
        store.create(second).await.unwrap();
    }
}
