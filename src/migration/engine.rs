//! Migration engine: drives a ticket through its phases, performing the
//! snapshot/transfer/verify/rehydrate work and the atomic ownership handoff
//! (spec.md §4.4).

use crate::a2a::client::A2aClient;
use crate::a2a::rpc::RpcRequest;
use crate::assignment::AssignmentStore;
use crate::audit::{AuditLog, NewAuditEntry};
use base64::Engine;
use crate::error::{MigrationError, MigrationErrorCode, MigrationErrorOrigin, RecoveryAction, Result};
use crate::migration::rehydrate::{extract_archive, reconcile_git_repos, verify_structure};
use crate::migration::snapshot::{build_archive, checksum_file};
use crate::migration::store::{TicketStore, TicketUpdate};
use crate::migration::ticket::{HomeState, MigrationTicket, OwnershipHolder, Phase};
use crate::retry::{with_retry, RetryPolicy};
use crate::{AgentId, AuditLevel, MigrationId, NodeId};
use dashmap::DashMap;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Drives migration tickets through their lifecycle on this node. A single
/// instance serves both source-side and target-side calls; which role a
/// given ticket plays is just whether `source_node`/`target_node` matches
/// the local node id.
pub struct MigrationEngine {
    tickets: Arc<dyn TicketStore>,
    assignments: Arc<dyn AssignmentStore>,
    audit: Arc<dyn AuditLog>,
    client: Arc<A2aClient>,
    local_node_id: NodeId,
    base_path: PathBuf,
    /// Per-agent home-state, distinct from the ticket's own phase
    /// (spec.md §4.4.2).
    home_states: DashMap<AgentId, HomeState>,
}

impl MigrationEngine {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        assignments: Arc<dyn AssignmentStore>,
        audit: Arc<dyn AuditLog>,
        client: Arc<A2aClient>,
        local_node_id: NodeId,
        base_path: PathBuf,
    ) -> Self {
        Self {
            tickets,
            assignments,
            audit,
            client,
            local_node_id,
            base_path,
            home_states: DashMap::new(),
        }
    }

    pub fn home_state(&self, agent_id: &AgentId) -> HomeState {
        self.home_states.get(agent_id).map(|s| *s).unwrap_or(HomeState::Active)
    }

    pub fn base_path(&self) -> PathBuf {
        self.base_path.clone()
    }

    async fn log(&self, agent_id: &AgentId, action: &str, level: AuditLevel, detail: impl Into<String>) {
        let _ = self
            .audit
            .append(NewAuditEntry {
                home_id: None,
                agent_id: Some(agent_id.to_string()),
                action: action.to_string(),
                level,
                detail: detail.into(),
                result: None,
                duration_ms: None,
            })
            .await;
    }

    /// REQUESTED -> AUTHORIZED. A fresh ticket is created and immediately
    /// authorized; finer-grained approval policy is a migration handler
    /// concern (spec.md §4.4.1), not the engine's.
    pub async fn initiate(
        &self,
        id: MigrationId,
        agent_id: AgentId,
        source_node: NodeId,
        target_node: NodeId,
    ) -> Result<MigrationTicket> {
        self.home_states.insert(agent_id.clone(), HomeState::Leased);
        let ticket = MigrationTicket::new(id, agent_id.clone(), source_node, target_node);
        let created = self.tickets.create(ticket).await?;
        self.log(&agent_id, "migration.initiate", AuditLevel::Yellow, "ticket created").await;

        self.tickets
            .apply(
                &created.id,
                TicketUpdate {
                    phase: Some(Phase::Authorized),
                    ..Default::default()
                },
            )
            .await
    }

    /// AUTHORIZED -> FREEZING -> FROZEN. Freezing is a local, synchronous
    /// state change: flip the home state so no new local work is accepted
    /// on the agent, and record it as frozen.
    pub async fn freeze(&self, id: &MigrationId) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Freezing), ..Default::default() })
            .await?;
        self.home_states.insert(ticket.agent_id.clone(), HomeState::Frozen);
        let result = self
            .tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Frozen), ..Default::default() })
            .await?;
        self.log(&ticket.agent_id, "migration.freeze", AuditLevel::Yellow, "home frozen").await;
        Ok(result)
    }

    /// FROZEN -> SNAPSHOTTING. Packages the agent's portable directory into
    /// a checksummed archive.
    pub async fn snapshot(&self, id: &MigrationId, portable_source: &Path) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Snapshotting), ..Default::default() })
            .await?;

        let archive_dest = self.base_path.join("archives").join(format!("{id}.tar.gz"));
        if let Some(parent) = archive_dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MigrationError::new(
                    MigrationErrorCode::SnapshotArchiveFailed,
                    "SNAPSHOTTING",
                    MigrationErrorOrigin::Source,
                    e.to_string(),
                )
            })?;
        }

        let snapshot = build_archive(portable_source, &archive_dest)?;

        let manifest_json = serde_json::to_string(&snapshot.manifest).map_err(|e| {
            MigrationError::new(
                MigrationErrorCode::SnapshotArchiveFailed,
                "SNAPSHOTTING",
                MigrationErrorOrigin::Source,
                e.to_string(),
            )
        })?;
        std::fs::write(manifest_sidecar_path(&archive_dest), manifest_json).map_err(|e| {
            MigrationError::new(
                MigrationErrorCode::SnapshotArchiveFailed,
                "SNAPSHOTTING",
                MigrationErrorOrigin::Source,
                e.to_string(),
            )
        })?;

        let result = self
            .tickets
            .apply(
                id,
                TicketUpdate {
                    portable_path: Some(archive_dest.to_string_lossy().to_string()),
                    archive_checksum: Some(snapshot.checksum_sha256.clone()),
                    archive_size_bytes: Some(snapshot.size_bytes),
                    ..Default::default()
                },
            )
            .await?;
        self.log(
            &ticket.agent_id,
            "migration.snapshot",
            AuditLevel::Yellow,
            format!("archive {} bytes, checksum {}", snapshot.size_bytes, snapshot.checksum_sha256),
        )
        .await;
        Ok(result)
    }

    /// SNAPSHOTTING -> TRANSFERRING -> VERIFYING, with retry governed by
    /// `MigrationErrorCode::recovery()`. The archive travels embedded as
    /// base64 in the RPC call rather than as a path, since the target node
    /// can't read the source's local filesystem. Landing in VERIFYING here
    /// does not move ownership yet — that only happens at the
    /// VERIFYING -> REHYDRATING edge, in `handle_verification`
    /// (spec.md §4.4.3 "ownership-transfer-atomicity").
    pub async fn transfer_and_verify(&self, id: &MigrationId) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Transferring), ..Default::default() })
            .await?;

        let portable_path = ticket
            .portable_path
            .clone()
            .ok_or_else(|| MigrationError::new(
                MigrationErrorCode::InternalStateInconsistency,
                "TRANSFERRING",
                MigrationErrorOrigin::Source,
                "no archive recorded on ticket",
            ))?;
        let expected_checksum = ticket.archive_checksum.clone().unwrap_or_default();
        let archive_bytes = std::fs::read(&portable_path).map_err(|e| MigrationError::new(
            MigrationErrorCode::TransferNetworkFailed,
            "TRANSFERRING",
            MigrationErrorOrigin::Source,
            e.to_string(),
        ))?;
        let archive_base64 = base64::engine::general_purpose::STANDARD.encode(&archive_bytes);

        let ticket_for_retry = ticket.clone();
        let archive_base64_for_retry = archive_base64.clone();
        let expected_checksum_for_retry = expected_checksum.clone();
        let client = Arc::clone(&self.client);

        let verify_result = self
            .advance_with_recovery(id, MigrationErrorCode::TransferNetworkFailed, "TRANSFERRING", || {
                let ticket = ticket_for_retry.clone();
                let archive_base64 = archive_base64_for_retry.clone();
                let expected_checksum = expected_checksum_for_retry.clone();
                let client = Arc::clone(&client);
                async move {
                    let request = RpcRequest::new(
                        json!(1),
                        "migration/transfer-and-verify",
                        json!({
                            "migrationId": ticket.id.to_string(),
                            "agentId": ticket.agent_id.to_string(),
                            "archiveBase64": archive_base64,
                            "expectedChecksum": expected_checksum,
                        }),
                    );
                    client
                        .call_node(&ticket.target_node, request)
                        .await
                        .map_err(|e| MigrationError::new(
                            MigrationErrorCode::TransferNetworkFailed,
                            "TRANSFERRING",
                            MigrationErrorOrigin::Target,
                            e.to_string(),
                        ))
                }
            })
            .await;

        let send_result = match verify_result {
            Ok(value) => value,
            Err(error) => return self.handle_phase_error(id, error).await,
        };

        let verified = send_result.raw.get("verified").and_then(serde_json::Value::as_bool).unwrap_or(false);
        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Verifying), ..Default::default() })
            .await?;
        self.handle_verification(id, verified, (!verified).then_some("target reported checksum mismatch".to_string()))
            .await
    }

    /// VERIFYING -> REHYDRATING. The only place ownership ever flips to the
    /// target, and it flips in the same compound write as the phase advance
    /// so `phase == REHYDRATING` and `ownership == target` always agree
    /// (spec.md §4.4.3 Property 5). Reachable either from
    /// `transfer_and_verify`'s own verification result, or directly via the
    /// `migration/verify` RPC when verification completes out of band.
    pub async fn handle_verification(
        &self,
        id: &MigrationId,
        verified: bool,
        failure_reason: Option<String>,
    ) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        if !verified {
            let error = MigrationError::new(
                MigrationErrorCode::VerifyChecksumMismatch,
                "VERIFYING",
                MigrationErrorOrigin::Target,
                failure_reason.unwrap_or_else(|| "verification failed".to_string()),
            );
            return self.handle_phase_error(id, error).await;
        }

        let result = self
            .tickets
            .apply(
                id,
                TicketUpdate {
                    phase: Some(Phase::Rehydrating),
                    ownership: Some(OwnershipHolder::Target),
                    ..Default::default()
                },
            )
            .await?;
        self.log(&ticket.agent_id, "migration.verify", AuditLevel::Yellow, "ownership transferred to target").await;
        Ok(result)
    }

    /// Target-side counterpart called via `migration/transfer-and-verify`:
    /// extract the archive, verify its checksum and structure.
    pub async fn receive_and_verify(
        &self,
        archive_path: &Path,
        expected_checksum: &str,
        dest: &Path,
    ) -> Result<bool> {
        let actual = checksum_file(archive_path)?;
        if actual != expected_checksum {
            return Ok(false);
        }
        extract_archive(archive_path, dest)?;
        Ok(true)
    }

    /// VERIFYING -> REHYDRATING -> FINALIZING, run on the target node after
    /// ownership has transferred.
    pub async fn rehydrate(&self, id: &MigrationId, dest: &Path) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Rehydrating), ..Default::default() })
            .await?;

        for warning in verify_structure(dest) {
            self.log(&ticket.agent_id, "migration.rehydrate", AuditLevel::Yellow, warning).await;
        }

        let manifest_path = ticket
            .portable_path
            .as_ref()
            .map(|p| manifest_sidecar_path(Path::new(p)))
            .unwrap_or_else(|| dest.join(".flock-manifest.json"));
        if manifest_path.exists() {
            let manifest_json = std::fs::read_to_string(&manifest_path).map_err(|e| {
                MigrationError::new(
                    MigrationErrorCode::RehydrateExtractFailed,
                    "REHYDRATING",
                    MigrationErrorOrigin::Target,
                    e.to_string(),
                )
            })?;
            let manifest = serde_json::from_str(&manifest_json).map_err(|e| {
                MigrationError::new(
                    MigrationErrorCode::RehydrateExtractFailed,
                    "REHYDRATING",
                    MigrationErrorOrigin::Target,
                    e.to_string(),
                )
            })?;
            let reconciliations = reconcile_git_repos(dest, &manifest);
            for repo in reconciliations.iter().filter(|r| r.needs_manual_reconciliation) {
                self.log(
                    &ticket.agent_id,
                    "migration.rehydrate",
                    AuditLevel::Yellow,
                    format!("repo {} needs manual reconciliation", repo.relative_path),
                )
                .await;
            }
        }

        self.assignments
            .assign(ticket.agent_id.clone(), ticket.target_node.clone(), dest.to_string_lossy().to_string())
            .await?;

        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Finalizing), ..Default::default() })
            .await
    }

    /// FINALIZING -> COMPLETED. Releases the source-side home state.
    pub async fn complete(&self, id: &MigrationId) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.home_states.insert(ticket.agent_id.clone(), HomeState::Active);
        let result = self
            .tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Completed), ..Default::default() })
            .await?;
        self.log(&ticket.agent_id, "migration.complete", AuditLevel::Green, "migration completed").await;
        Ok(result)
    }

    /// Roll back to the home-state a given phase implies, per spec.md §4.4's
    /// restoration table. The source home never ends a rollback `ACTIVE`: a
    /// migration that got far enough to freeze left the source `LEASED`
    /// (still the agent's home, just not runnable until the ticket resolves
    /// one way or another), so rollback restores `LEASED`, not `ACTIVE`.
    /// Ownership having already moved to the target changes what gets
    /// restored, not whether `ACTIVE` is ever a valid rollback outcome.
    pub async fn rollback(&self, id: &MigrationId) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.tickets
            .apply(id, TicketUpdate { phase: Some(Phase::RollingBack), ..Default::default() })
            .await?;

        match (ticket.phase, ticket.ownership) {
            // Nothing has touched the home state yet.
            (Phase::Requested | Phase::Authorized, _) => {}
            // Home was frozen locally; never transferred. Restore LEASED.
            (Phase::Freezing | Phase::Frozen | Phase::Snapshotting, _) => {
                self.home_states.insert(ticket.agent_id.clone(), HomeState::Leased);
            }
            // In flight: ownership may or may not have moved yet, but either
            // way the source is never handed back ACTIVE mid-migration.
            (Phase::Transferring | Phase::Verifying, _) => {
                self.home_states.insert(ticket.agent_id.clone(), HomeState::Leased);
            }
            // Ownership already moved to the target; only the target side
            // ever had an ACTIVE-bound home to unwind, and only if it was
            // actually in flight there.
            (Phase::Rehydrating | Phase::Finalizing, OwnershipHolder::Target) => {
                self.home_states.insert(ticket.agent_id.clone(), HomeState::Retired);
            }
            (Phase::Rehydrating | Phase::Finalizing, OwnershipHolder::Source) => {
                self.home_states.insert(ticket.agent_id.clone(), HomeState::Leased);
            }
            (Phase::Completed | Phase::RollingBack | Phase::Aborted, _) => {}
        }

        let result = self
            .tickets
            .apply(id, TicketUpdate { phase: Some(Phase::Aborted), ..Default::default() })
            .await?;
        self.log(&ticket.agent_id, "migration.rollback", AuditLevel::Red, "migration rolled back").await;
        Ok(result)
    }

    pub async fn abort(&self, id: &MigrationId, reason: impl Into<String>) -> Result<MigrationTicket> {
        let ticket = self.get(id).await?;
        self.home_states.insert(ticket.agent_id.clone(), HomeState::Active);
        let result = self
            .tickets
            .apply(
                id,
                TicketUpdate {
                    phase: Some(Phase::Aborted),
                    error: Some(reason.into()),
                    ..Default::default()
                },
            )
            .await?;
        self.log(&ticket.agent_id, "migration.abort", AuditLevel::Red, "migration aborted").await;
        Ok(result)
    }

    pub async fn status(&self, id: &MigrationId) -> Result<MigrationTicket> {
        self.get(id).await
    }

    async fn get(&self, id: &MigrationId) -> Result<MigrationTicket> {
        self.tickets.get(id).await?.ok_or_else(|| {
            crate::error::StoreError::NotFound {
                entity: "migration_ticket",
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Apply `MigrationErrorCode::recovery()`'s policy to `f`: retry with
    /// backoff for `Retry`, or surface the error untouched so the caller can
    /// route to rollback/abort (spec.md §4.4.5).
    async fn advance_with_recovery<T, F, Fut>(
        &self,
        _id: &MigrationId,
        default_code: MigrationErrorCode,
        label: &str,
        mut f: F,
    ) -> std::result::Result<T, MigrationError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, MigrationError>>,
    {
        match default_code.recovery() {
            RecoveryAction::Retry { max_attempts, delay_ms } => {
                let policy = RetryPolicy::new(max_attempts, std::time::Duration::from_millis(delay_ms));
                with_retry(policy, label, &mut f).await
            }
            RecoveryAction::AutoRollback | RecoveryAction::Abort { .. } => f().await,
        }
    }

    async fn handle_phase_error(&self, id: &MigrationId, error: MigrationError) -> Result<MigrationTicket> {
        self.tickets
            .apply(
                id,
                TicketUpdate {
                    error: Some(error.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        match error.recovery() {
            RecoveryAction::AutoRollback => self.rollback(id).await,
            RecoveryAction::Abort { .. } => self.abort(id, error.to_string()).await,
            RecoveryAction::Retry { .. } => Err(error.into()),
        }
    }
}

/// Where the work-state manifest for a given archive lives: a sidecar JSON
/// file next to it, not bundled inside the tar itself.
fn manifest_sidecar_path(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".manifest.json");
    archive_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::server::{A2aServer, MigrationHandler};
    use crate::agent_card::CardRegistry;
    use crate::assignment::InMemoryAssignmentStore;
    use crate::audit::InMemoryAuditLog;
    use crate::config::Topology;
    use crate::migration::store::InMemoryTicketStore;
    use crate::node_registry::NodeRegistry;
    use crate::tasks::Executor;
    use crate::tasks::executor::SessionSend;
    use crate::triage::TriageCapture;
    use crate::AgentId;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopMigrationHandler;

    #[async_trait]
    impl MigrationHandler for NoopMigrationHandler {
        async fn handle(&self, _method: &str, _params: serde_json::Value) -> std::result::Result<serde_json::Value, crate::error::TransportError> {
            Ok(serde_json::json!({"verified": true}))
        }
    }

    struct NoopSession;

    #[async_trait]
    impl SessionSend for NoopSession {
        async fn send(&self, _agent_id: &AgentId, _text: &str, _session_key: Option<&str>) -> Option<String> {
            None
        }
    }

    fn make_engine(base_path: PathBuf) -> MigrationEngine {
        let cards = Arc::new(CardRegistry::new());
        let store = Arc::new(crate::tasks::store::InMemoryTaskStore::new());
        let triage = Arc::new(TriageCapture::new(Duration::from_secs(60)));
        let audit: Arc<dyn AuditLog> = Arc::new(InMemoryAuditLog::new());
        let executor = Arc::new(Executor::new(
            store,
            triage,
            Arc::new(NoopSession),
            audit.clone(),
            Duration::from_secs(60),
        ));
        let migration_handler: Arc<dyn MigrationHandler> = Arc::new(NoopMigrationHandler);
        let server = Arc::new(A2aServer::new(cards, executor, migration_handler));
        let node_registry = Arc::new(NodeRegistry::new(None, reqwest::Client::new()));
        let client = Arc::new(A2aClient::new(
            server,
            node_registry,
            "node-1".into(),
            Topology::Peer,
            reqwest::Client::new(),
            Duration::from_secs(5),
        ));
        let tickets: Arc<dyn TicketStore> = Arc::new(InMemoryTicketStore::new());
        let assignments: Arc<dyn AssignmentStore> = Arc::new(InMemoryAssignmentStore::new());
        MigrationEngine::new(tickets, assignments, audit, client, "node-1".into(), base_path)
    }

    #[tokio::test]
    async fn initiate_creates_authorized_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path().to_path_buf());
        let ticket = engine
            .initiate("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into())
            .await
            .unwrap();
        assert_eq!(ticket.phase, Phase::Authorized);
        assert_eq!(engine.home_state(&"worker-a".into()), HomeState::Leased);
    }

    #[tokio::test]
    async fn freeze_sets_home_state_and_phase() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path().to_path_buf());
        engine
            .initiate("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into())
            .await
            .unwrap();
        let ticket = engine.freeze(&"mig-1".into()).await.unwrap();
        assert_eq!(ticket.phase, Phase::Frozen);
        assert_eq!(engine.home_state(&"worker-a".into()), HomeState::Frozen);
    }

    #[tokio::test]
    async fn snapshot_writes_archive_and_manifest_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path().to_path_buf());
        engine
            .initiate("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into())
            .await
            .unwrap();
        engine.freeze(&"mig-1".into()).await.unwrap();

        let portable = dir.path().join("portable");
        std::fs::create_dir_all(&portable).unwrap();
        std::fs::write(portable.join("note.txt"), b"hello").unwrap();

        let ticket = engine.snapshot(&"mig-1".into(), &portable).await.unwrap();
        assert_eq!(ticket.phase, Phase::Snapshotting);
        assert!(ticket.archive_checksum.is_some());

        let archive_path = PathBuf::from(ticket.portable_path.unwrap());
        assert!(archive_path.exists());
        assert!(manifest_sidecar_path(&archive_path).exists());
    }

    #[tokio::test]
    async fn rollback_restores_leased_state_when_source_still_owns() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path().to_path_buf());
        engine
            .initiate("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into())
            .await
            .unwrap();
        engine.freeze(&"mig-1".into()).await.unwrap();
        let ticket = engine.rollback(&"mig-1".into()).await.unwrap();
        assert_eq!(ticket.phase, Phase::Aborted);
        assert_eq!(engine.home_state(&"worker-a".into()), HomeState::Leased);
    }

    #[tokio::test]
    async fn abort_records_reason_and_restores_active() {
        let dir = tempfile::tempdir().unwrap();
        let engine = make_engine(dir.path().to_path_buf());
        engine
            .initiate("mig-1".into(), "worker-a".into(), "node-1".into(), "node-2".into())
            .await
            .unwrap();
        let ticket = engine.abort(&"mig-1".into(), "operator cancelled").await.unwrap();
        assert_eq!(ticket.phase, Phase::Aborted);
        assert_eq!(ticket.error.as_deref(), Some("operator cancelled"));
    }
}
