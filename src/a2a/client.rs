//! Outbound A2A routing: resolve an agent to a location (local, peer node,
//! or central hub) and deliver the JSON-RPC call there (spec.md §4.5).
//!
//! The `Resolver`/`ResolverDyn` split mirrors the async-fn-in-trait +
//! type-erased companion pattern used elsewhere in this codebase for
//! dynamic dispatch over an async trait object.

use crate::a2a::rpc::RpcRequest;
use crate::a2a::server::A2aServer;
use crate::config::Topology;
use crate::error::TransportError;
use crate::node_registry::NodeRegistry;
use crate::{AgentId, NodeId};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Where an agent currently lives, from this node's point of view.
#[derive(Debug, Clone)]
pub enum Location {
    Local,
    Remote { node_id: NodeId, endpoint: String },
}

/// Resolves an agent id to a location. Implemented directly by `A2aClient`;
/// split out so alternate resolution strategies (e.g. a test double with a
/// fixed routing table) can be substituted.
pub trait Resolver: Send + Sync {
    fn resolve(&self, agent_id: &AgentId) -> impl Future<Output = Option<Location>> + Send;
}

/// Type-erased companion to `Resolver`, needed wherever a `dyn Resolver` is
/// held (AFIT return types aren't themselves object-safe).
pub trait ResolverDyn: Send + Sync {
    fn resolve_dyn<'a>(
        &'a self,
        agent_id: &'a AgentId,
    ) -> Pin<Box<dyn Future<Output = Option<Location>> + Send + 'a>>;
}

impl<T: Resolver> ResolverDyn for T {
    fn resolve_dyn<'a>(
        &'a self,
        agent_id: &'a AgentId,
    ) -> Pin<Box<dyn Future<Output = Option<Location>> + Send + 'a>> {
        Box::pin(self.resolve(agent_id))
    }
}

/// The normalized shape every A2A call collapses to, regardless of whether
/// it was served locally or over HTTP (spec.md §4.5).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SendResult {
    pub task_id: Option<String>,
    pub state: Option<String>,
    pub response: Option<Value>,
    pub artifacts: Vec<Value>,
    pub raw: Value,
}

/// Sends A2A JSON-RPC calls, resolving the target's location first.
/// Performs no client-side retry — callers (e.g. the migration engine) wrap
/// calls with `retry::with_retry` themselves.
pub struct A2aClient {
    local_server: Arc<A2aServer>,
    node_registry: Arc<NodeRegistry>,
    local_node_id: NodeId,
    topology: Topology,
    http: reqwest::Client,
    remote_timeout: Duration,
}

impl A2aClient {
    pub fn new(
        local_server: Arc<A2aServer>,
        node_registry: Arc<NodeRegistry>,
        local_node_id: NodeId,
        topology: Topology,
        http: reqwest::Client,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            local_server,
            node_registry,
            local_node_id,
            topology,
            http,
            remote_timeout,
        }
    }

    /// Send a JSON-RPC request to `agent_id`, dispatching locally or
    /// forwarding over HTTP depending on where resolution lands it.
    pub async fn send(
        &self,
        agent_id: &AgentId,
        request: RpcRequest,
    ) -> Result<SendResult, TransportError> {
        match self.resolve(agent_id).await {
            Some(Location::Local) => {
                let response = self.local_server.handle_request(agent_id, request).await;
                if let Some(error) = response.error {
                    return Err(TransportError::Internal(error.message));
                }
                Ok(Self::normalize(response.result.unwrap_or(Value::Null)))
            }
            Some(Location::Remote { endpoint, .. }) => self.send_remote(&endpoint, agent_id, request).await,
            None => Err(TransportError::UnknownAgent(agent_id.to_string())),
        }
    }

    /// Call a reserved `migration/*` method on a specific node by id,
    /// bypassing agent-based resolution entirely (migration tickets name
    /// their source/target nodes explicitly, spec.md §4.4).
    pub async fn call_node(&self, node_id: &NodeId, request: RpcRequest) -> Result<SendResult, TransportError> {
        if *node_id == self.local_node_id {
            let sentinel: AgentId = "__migration__".into();
            let response = self.local_server.handle_request(&sentinel, request).await;
            if let Some(error) = response.error {
                return Err(TransportError::Internal(error.message));
            }
            return Ok(Self::normalize(response.result.unwrap_or(Value::Null)));
        }

        let entry = self
            .node_registry
            .get(node_id)
            .ok_or_else(|| TransportError::UnknownNode(node_id.to_string()))?;
        self.send_remote(&entry.a2a_endpoint, &"__migration__".into(), request).await
    }

    async fn send_remote(
        &self,
        endpoint: &str,
        agent_id: &AgentId,
        request: RpcRequest,
    ) -> Result<SendResult, TransportError> {
        let url = format!("{}/a2a/{}", endpoint.trim_end_matches('/'), agent_id);
        let response = self
            .http
            .post(&url)
            .timeout(self.remote_timeout)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let envelope: crate::a2a::rpc::RpcResponse = response
            .json()
            .await
            .map_err(|e| TransportError::MalformedEnvelope(e.to_string()))?;

        if let Some(error) = envelope.error {
            return Err(TransportError::Internal(error.message));
        }
        Ok(Self::normalize(envelope.result.unwrap_or(Value::Null)))
    }

    fn normalize(result: Value) -> SendResult {
        SendResult {
            task_id: result.get("taskId").and_then(Value::as_str).map(String::from),
            state: result.get("status").and_then(Value::as_str).map(String::from),
            response: result.get("response").cloned(),
            artifacts: result
                .get("artifacts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            raw: result,
        }
    }
}

impl Resolver for A2aClient {
    async fn resolve(&self, agent_id: &AgentId) -> Option<Location> {
        if self.local_server.has_agent(agent_id) {
            return Some(Location::Local);
        }

        if let Some(lookup) = self.node_registry.find_node_for_agent_with_parent(agent_id).await {
            if lookup.entry.node_id == self.local_node_id {
                return Some(Location::Local);
            }
            return Some(Location::Remote {
                node_id: lookup.entry.node_id.clone(),
                endpoint: lookup.entry.a2a_endpoint.clone(),
            });
        }

        // Central-topology fallback: an unresolved agent is assumed to live
        // at the hub (spec.md §4.3's stated default for unknown-home callers).
        if let Topology::CentralWorker { central_endpoint } = &self.topology {
            return Some(Location::Remote {
                node_id: "central".into(),
                endpoint: central_endpoint.clone(),
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_extracts_known_fields() {
        let result = A2aClient::normalize(json!({
            "taskId": "task-1",
            "status": "completed",
            "response": {"text": "done"},
            "artifacts": [{"name": "out.txt"}],
        }));
        assert_eq!(result.task_id.as_deref(), Some("task-1"));
        assert_eq!(result.state.as_deref(), Some("completed"));
        assert_eq!(result.artifacts.len(), 1);
    }

    #[test]
    fn normalize_tolerates_missing_fields() {
        let result = A2aClient::normalize(json!({"ok": true}));
        assert!(result.task_id.is_none());
        assert!(result.artifacts.is_empty());
    }
}
