//! The in-process A2A server: agent registration, card directory exposure,
//! and JSON-RPC request dispatch (spec.md §4.5, §6).

use crate::a2a::rpc::{Message, RpcRequest, RpcResponse, Task};
use crate::agent_card::{AgentCard, CardRegistry};
use crate::error::TransportError;
use crate::tasks::Executor;
use crate::AgentId;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Handles the reserved `migration/*` JSON-RPC namespace. Implemented by
/// `migration::handlers::MigrationHandlers`; kept behind a trait here so the
/// transport layer doesn't depend on migration internals.
#[async_trait]
pub trait MigrationHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, TransportError>;
}

/// Routes inbound JSON-RPC calls to the right local agent's task executor,
/// or to the migration handler for reserved methods.
pub struct A2aServer {
    cards: Arc<CardRegistry>,
    executor: Arc<Executor>,
    // The real migration handler needs an `A2aClient` that in turn holds this
    // server, so it can't be supplied at construction time. Wiring
    // (`node::build`) constructs the server with a placeholder and swaps in
    // the real handler once the rest of the graph exists.
    migration: ArcSwap<dyn MigrationHandler>,
}

impl A2aServer {
    pub fn new(
        cards: Arc<CardRegistry>,
        executor: Arc<Executor>,
        migration: Arc<dyn MigrationHandler>,
    ) -> Self {
        Self {
            cards,
            executor,
            migration: ArcSwap::new(migration),
        }
    }

    /// Replace the migration handler after construction, resolving the
    /// server/client/engine construction cycle.
    pub fn set_migration_handler(&self, migration: Arc<dyn MigrationHandler>) {
        self.migration.store(migration);
    }

    pub fn register_agent(&self, agent_id: AgentId, card: AgentCard) {
        self.cards.register(agent_id, card);
    }

    pub fn unregister_agent(&self, agent_id: &AgentId) {
        self.cards.unregister(agent_id);
    }

    pub fn has_agent(&self, agent_id: &AgentId) -> bool {
        self.cards.has_agent(agent_id)
    }

    pub fn get_agent_card(&self, agent_id: &AgentId) -> Option<AgentCard> {
        self.cards.get_card(agent_id)
    }

    pub fn list_agent_cards(&self) -> Vec<AgentCard> {
        self.cards.list_cards()
    }

    /// Dispatch a JSON-RPC request addressed to `agent_id`.
    ///
    /// `migration/*` methods are reserved and never reach an agent's own
    /// handler, regardless of which agent the envelope targets.
    pub async fn handle_request(&self, agent_id: &AgentId, request: RpcRequest) -> RpcResponse {
        let result = self.dispatch(agent_id, &request).await;
        match result {
            Ok(value) => RpcResponse::success(request.id, value),
            Err(error) => RpcResponse::failure(request.id, &error),
        }
    }

    async fn dispatch(&self, agent_id: &AgentId, request: &RpcRequest) -> Result<Value, TransportError> {
        if request.method.starts_with("migration/") {
            return self.migration.load().handle(&request.method, request.params.clone()).await;
        }

        if !self.has_agent(agent_id) {
            return Err(TransportError::UnknownAgent(agent_id.to_string()));
        }

        match request.method.as_str() {
            // Streaming degrades to a single non-streaming `Task` response:
            // there's no SSE/chunked transport in scope, just the same
            // submit-and-return-the-task-record path as `message/send`.
            "message/send" | "message/stream" => {
                let message_value = request
                    .params
                    .get("message")
                    .cloned()
                    .ok_or_else(|| TransportError::InvalidParams("missing message".into()))?;
                let message: Message = serde_json::from_value(message_value)
                    .map_err(|e| TransportError::InvalidParams(e.to_string()))?;
                let task = self
                    .executor
                    .submit(agent_id.clone(), message)
                    .await
                    .map_err(|e| TransportError::Internal(e.to_string()))?;
                serde_json::to_value(task).map_err(|e| TransportError::Internal(e.to_string()))
            }
            "tasks/get" => {
                let task_id = request
                    .params
                    .get("taskId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::InvalidParams("missing taskId".into()))?;
                let task: Task = self
                    .executor
                    .get_task(&task_id.into())
                    .await
                    .map_err(|e| TransportError::Internal(e.to_string()))?
                    .ok_or_else(|| TransportError::InvalidParams(format!("unknown task {task_id}")))?;
                serde_json::to_value(task).map_err(|e| TransportError::Internal(e.to_string()))
            }
            "tasks/cancel" => {
                let task_id = request
                    .params
                    .get("taskId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::InvalidParams("missing taskId".into()))?;
                self.executor
                    .cancel_task(&task_id.into())
                    .await
                    .map_err(|e| TransportError::Internal(e.to_string()))?;
                Ok(Value::Bool(true))
            }
            other => Err(TransportError::MethodNotFound(other.to_string())),
        }
    }
}
