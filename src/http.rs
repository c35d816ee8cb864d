//! HTTP front door: agent discovery, the A2A JSON-RPC endpoint, and a health
//! check (spec.md §1, §6).

use crate::a2a::rpc::RpcRequest;
use crate::a2a::server::A2aServer;
use crate::agent_card::CardRegistry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

pub struct HttpState {
    pub server: Arc<A2aServer>,
    pub cards: Arc<CardRegistry>,
    pub node_id: String,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct DirectoryAgent {
    id: String,
    url: String,
}

#[derive(Serialize)]
struct DirectoryResponse {
    agents: Vec<DirectoryAgent>,
}

async fn agent_card_directory(State(state): State<Arc<HttpState>>) -> Json<DirectoryResponse> {
    let agents = state
        .cards
        .list_cards()
        .into_iter()
        .map(|card| DirectoryAgent {
            id: card.metadata.node_id.clone() + "/" + &card.name,
            url: card.url,
        })
        .collect();
    Json(DirectoryResponse { agents })
}

async fn a2a_dispatch(
    State(state): State<Arc<HttpState>>,
    Path(agent_id): Path<String>,
    Json(request): Json<RpcRequest>,
) -> impl IntoResponse {
    let response = state.server.handle_request(&agent_id.into(), request).await;
    Json(response)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "nodeId")]
    node_id: String,
    agents: Vec<String>,
    #[serde(rename = "discoveryComplete")]
    discovery_complete: bool,
}

async fn health(State(state): State<Arc<HttpState>>) -> Json<HealthResponse> {
    let agents = state.cards.list_cards().into_iter().map(|c| c.name).collect();
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        agents,
        discovery_complete: true,
    })
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

fn router(state: Arc<HttpState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/.well-known/agent-card.json", get(agent_card_directory))
        .route("/a2a/{agent_id}", post(a2a_dispatch))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the HTTP front door, returning its task handle. The server
/// stops accepting new connections and drains in-flight ones once
/// `shutdown_rx` observes `true`.
pub async fn serve(
    bind: SocketAddr,
    state: Arc<HttpState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> crate::Result<tokio::task::JoinHandle<()>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;

    Ok(tokio::spawn(async move {
        let serve_result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|v| *v).await;
            })
            .await;
        if let Err(error) = serve_result {
            tracing::error!(%error, "http server exited with an error");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_card::{AgentCard, CardMetadata};
    use crate::tasks::Executor;
    use crate::tasks::executor::SessionSend;
    use crate::tasks::store::InMemoryTaskStore;
    use crate::triage::TriageCapture;
    use crate::{AgentId, AgentRole};
    use async_trait::async_trait;

    struct NoopMigrationHandler;

    #[async_trait]
    impl crate::a2a::server::MigrationHandler for NoopMigrationHandler {
        async fn handle(&self, method: &str, _params: Value) -> Result<Value, crate::error::TransportError> {
            Err(crate::error::TransportError::MethodNotFound(method.to_string()))
        }
    }

    struct NoopSession;

    #[async_trait]
    impl SessionSend for NoopSession {
        async fn send(&self, _agent_id: &AgentId, _text: &str, _session_key: Option<&str>) -> Option<String> {
            None
        }
    }

    fn make_state() -> Arc<HttpState> {
        let cards = Arc::new(CardRegistry::new());
        cards.register(
            "worker-a".into(),
            AgentCard {
                name: "worker-a".into(),
                description: "test agent".into(),
                version: "0.1.0".into(),
                url: "http://localhost:4000/a2a/worker-a".into(),
                metadata: CardMetadata {
                    role: AgentRole::Worker,
                    archetype: None,
                    node_id: "node-1".into(),
                },
                skills: vec![],
            },
        );
        let store = Arc::new(InMemoryTaskStore::new());
        let triage = Arc::new(TriageCapture::new(std::time::Duration::from_secs(60)));
        let audit = Arc::new(crate::audit::InMemoryAuditLog::new());
        let executor = Arc::new(Executor::new(
            store,
            triage,
            Arc::new(NoopSession),
            audit,
            std::time::Duration::from_secs(60),
        ));
        let migration: Arc<dyn crate::a2a::server::MigrationHandler> = Arc::new(NoopMigrationHandler);
        let server = Arc::new(A2aServer::new(cards.clone(), executor, migration));
        Arc::new(HttpState {
            server,
            cards,
            node_id: "node-1".into(),
            started_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn health_reports_registered_agents() {
        let state = make_state();
        let Json(body) = health(State(state)).await;
        assert_eq!(body.node_id, "node-1");
        assert_eq!(body.agents, vec!["worker-a".to_string()]);
    }

    #[tokio::test]
    async fn directory_lists_registered_cards() {
        let state = make_state();
        let Json(body) = agent_card_directory(State(state)).await;
        assert_eq!(body.agents.len(), 1);
        assert_eq!(body.agents[0].url, "http://localhost:4000/a2a/worker-a");
    }

    #[test]
    fn router_builds_without_panicking() {
        let state = make_state();
        let _ = router(state);
    }
}
