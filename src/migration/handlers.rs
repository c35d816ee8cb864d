//! Exposes the reserved `migration/*` JSON-RPC namespace
//! (spec.md §4.4, §6) by routing each method name to a `MigrationEngine`
//! call. Implements `a2a::server::MigrationHandler`.

use crate::a2a::server::MigrationHandler;
use crate::error::TransportError;
use crate::migration::engine::MigrationEngine;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

pub struct MigrationHandlers {
    engine: Arc<MigrationEngine>,
}

impl MigrationHandlers {
    pub fn new(engine: Arc<MigrationEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
struct InitiateParams {
    migration_id: String,
    agent_id: String,
    source_node: String,
    target_node: String,
}

#[derive(Debug, Deserialize)]
struct TicketIdParams {
    migration_id: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotParams {
    migration_id: String,
    portable_source: String,
}

#[derive(Debug, Deserialize)]
struct TransferAndVerifyParams {
    #[serde(rename = "migrationId")]
    migration_id: String,
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(rename = "archiveBase64")]
    archive_base64: String,
    #[serde(rename = "expectedChecksum")]
    expected_checksum: String,
}

#[derive(Debug, Deserialize)]
struct RehydrateParams {
    migration_id: String,
    dest: String,
}

#[derive(Debug, Deserialize)]
struct AbortParams {
    migration_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyParams {
    migration_id: String,
    verified: bool,
    #[serde(default)]
    failure_reason: Option<String>,
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|e| TransportError::InvalidParams(e.to_string()))
}

fn internal<E: std::fmt::Display>(error: E) -> TransportError {
    TransportError::Internal(error.to_string())
}

#[async_trait]
impl MigrationHandler for MigrationHandlers {
    async fn handle(&self, method: &str, params_value: Value) -> Result<Value, TransportError> {
        match method {
            "migration/request" => {
                let p: InitiateParams = params(params_value)?;
                let ticket = self
                    .engine
                    .initiate(p.migration_id.into(), p.agent_id.into(), p.source_node.into(), p.target_node.into())
                    .await
                    .map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            // Approval is a no-op at the transport layer today: `initiate`
            // already authorizes. Kept as a distinct reserved method so a
            // future approval policy can intercept it without a wire
            // protocol change.
            "migration/approve" => {
                let p: TicketIdParams = params(params_value)?;
                let ticket = self.engine.status(&p.migration_id.into()).await.map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/reject" => {
                let p: AbortParams = params(params_value)?;
                let ticket = self
                    .engine
                    .abort(&p.migration_id.into(), p.reason.unwrap_or_else(|| "rejected".to_string()))
                    .await
                    .map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/freeze" => {
                let p: TicketIdParams = params(params_value)?;
                let ticket = self.engine.freeze(&p.migration_id.into()).await.map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/snapshot" => {
                let p: SnapshotParams = params(params_value)?;
                let ticket = self
                    .engine
                    .snapshot(&p.migration_id.into(), &PathBuf::from(p.portable_source))
                    .await
                    .map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/run" => {
                let p: TicketIdParams = params(params_value)?;
                let ticket = self.engine.transfer_and_verify(&p.migration_id.into()).await.map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            // Target-side: receives the transferred archive embedded as
            // base64 (the source's local path means nothing here), extracts
            // it, and reports whether it verified (spec.md §4.4.4
            // "VERIFYING"). The caller (the source node's
            // `transfer_and_verify`) inspects the `verified` field and
            // drives the ownership flip itself via `handle_verification`.
            "migration/transfer-and-verify" => {
                let p: TransferAndVerifyParams = params(params_value)?;
                let archive_bytes = base64::engine::general_purpose::STANDARD
                    .decode(&p.archive_base64)
                    .map_err(|e| TransportError::InvalidParams(e.to_string()))?;
                let staging_dir = self.engine_base_path().join("migrations").join(&p.migration_id);
                std::fs::create_dir_all(&staging_dir).map_err(internal)?;
                let archive_path = staging_dir.join("received.tar.gz");
                std::fs::write(&archive_path, &archive_bytes).map_err(internal)?;

                let dest = staging_dir.join(&p.agent_id);
                let verified = self
                    .engine
                    .receive_and_verify(&archive_path, &p.expected_checksum, &dest)
                    .await
                    .map_err(internal)?;
                Ok(serde_json::json!({ "verified": verified }))
            }

            // Out-of-band verification result, e.g. when the target side
            // checks the archive asynchronously instead of inline with
            // `migration/transfer-and-verify`'s response.
            "migration/verify" => {
                let p: VerifyParams = params(params_value)?;
                let ticket = self
                    .engine
                    .handle_verification(&p.migration_id.into(), p.verified, p.failure_reason)
                    .await
                    .map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/rehydrate" => {
                let p: RehydrateParams = params(params_value)?;
                let ticket = self
                    .engine
                    .rehydrate(&p.migration_id.into(), &PathBuf::from(p.dest))
                    .await
                    .map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/complete" => {
                let p: TicketIdParams = params(params_value)?;
                let ticket = self.engine.complete(&p.migration_id.into()).await.map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/abort" => {
                let p: AbortParams = params(params_value)?;
                let ticket = self
                    .engine
                    .abort(&p.migration_id.into(), p.reason.unwrap_or_else(|| "aborted".to_string()))
                    .await
                    .map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            "migration/status" => {
                let p: TicketIdParams = params(params_value)?;
                let ticket = self.engine.status(&p.migration_id.into()).await.map_err(internal)?;
                serde_json::to_value(ticket).map_err(internal)
            }

            other => Err(TransportError::MethodNotFound(other.to_string())),
        }
    }
}

impl MigrationHandlers {
    fn engine_base_path(&self) -> PathBuf {
        self.engine.base_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::client::A2aClient;
    use crate::a2a::server::A2aServer;
    use crate::agent_card::CardRegistry;
    use crate::assignment::InMemoryAssignmentStore;
    use crate::audit::InMemoryAuditLog;
    use crate::config::Topology;
    use crate::migration::store::InMemoryTicketStore;
    use crate::node_registry::NodeRegistry;
    use crate::tasks::Executor;
    use crate::tasks::executor::SessionSend;
    use crate::tasks::store::InMemoryTaskStore;
    use crate::triage::TriageCapture;
    use crate::AgentId;
    use std::time::Duration;

    struct PlaceholderHandler;

    #[async_trait]
    impl MigrationHandler for PlaceholderHandler {
        async fn handle(&self, _method: &str, _params: Value) -> Result<Value, TransportError> {
            Err(TransportError::MethodNotFound("unreachable in this test".into()))
        }
    }

    struct NoopSession;

    #[async_trait]
    impl SessionSend for NoopSession {
        async fn send(&self, _agent_id: &AgentId, _text: &str, _session_key: Option<&str>) -> Option<String> {
            None
        }
    }

    fn make_handlers(base_path: PathBuf) -> MigrationHandlers {
        let cards = Arc::new(CardRegistry::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let triage = Arc::new(TriageCapture::new(Duration::from_secs(60)));
        let audit = Arc::new(InMemoryAuditLog::new());
        let executor = Arc::new(Executor::new(
            store,
            triage,
            Arc::new(NoopSession),
            audit.clone(),
            Duration::from_secs(60),
        ));
        let placeholder: Arc<dyn MigrationHandler> = Arc::new(PlaceholderHandler);
        let server = Arc::new(A2aServer::new(cards, executor, placeholder));
        let node_registry = Arc::new(NodeRegistry::new(None, reqwest::Client::new()));
        let client = Arc::new(A2aClient::new(
            server,
            node_registry,
            "node-1".into(),
            Topology::Peer,
            reqwest::Client::new(),
            Duration::from_secs(5),
        ));
        let tickets = Arc::new(InMemoryTicketStore::new());
        let assignments = Arc::new(InMemoryAssignmentStore::new());
        let engine = Arc::new(MigrationEngine::new(tickets, assignments, audit, client, "node-1".into(), base_path));
        MigrationHandlers::new(engine)
    }

    #[tokio::test]
    async fn request_then_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let handlers = make_handlers(dir.path().to_path_buf());

        let created = handlers
            .handle(
                "migration/request",
                serde_json::json!({
                    "migration_id": "mig-1",
                    "agent_id": "worker-a",
                    "source_node": "node-1",
                    "target_node": "node-2",
                }),
            )
            .await
            .unwrap();
        assert_eq!(created["phase"], serde_json::json!("AUTHORIZED"));

        let status = handlers
            .handle("migration/status", serde_json::json!({"migration_id": "mig-1"}))
            .await
            .unwrap();
        assert_eq!(status["id"], serde_json::json!("mig-1"));
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handlers = make_handlers(dir.path().to_path_buf());
        let err = handlers.handle("migration/nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::MethodNotFound(_)));
    }

    #[tokio::test]
    async fn abort_reports_reason() {
        let dir = tempfile::tempdir().unwrap();
        let handlers = make_handlers(dir.path().to_path_buf());
        handlers
            .handle(
                "migration/request",
                serde_json::json!({
                    "migration_id": "mig-1",
                    "agent_id": "worker-a",
                    "source_node": "node-1",
                    "target_node": "node-2",
                }),
            )
            .await
            .unwrap();

        let aborted = handlers
            .handle(
                "migration/abort",
                serde_json::json!({"migration_id": "mig-1", "reason": "operator cancelled"}),
            )
            .await
            .unwrap();
        assert_eq!(aborted["phase"], serde_json::json!("ABORTED"));
        assert_eq!(aborted["error"], serde_json::json!("operator cancelled"));
    }
}
