//! Node wiring: constructs every component for a single Flock node from its
//! config and owns the background tasks and shutdown signal that bind them
//! together (spec.md §2).

use crate::a2a::client::A2aClient;
use crate::a2a::server::{A2aServer, MigrationHandler};
use crate::agent_card::CardRegistry;
use crate::assignment::{AssignmentStore, InMemoryAssignmentStore, SqliteAssignmentStore};
use crate::audit::{AuditLog, InMemoryAuditLog, SqliteAuditLog};
use crate::channel::bridge::{BridgeStore, InMemoryBridgeStore, SqliteBridgeStore};
use crate::channel::messages::{ChannelMessageStore, InMemoryChannelMessageStore, SqliteChannelMessageStore};
use crate::channel::store::{ChannelStore, InMemoryChannelStore, SqliteChannelStore};
use crate::channel::InboundBridge;
use crate::config::{NodeConfig, StoreBackend};
use crate::error::{ConfigError, TransportError};
use crate::migration::engine::MigrationEngine;
use crate::migration::handlers::MigrationHandlers;
use crate::migration::store::{InMemoryTicketStore, SqliteTicketStore, TicketStore};
use crate::node_registry::NodeRegistry;
use crate::scheduler::Scheduler;
use crate::tasks::executor::SessionSend;
use crate::tasks::store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
use crate::tasks::Executor;
use crate::triage::{self, TriageCapture};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Rejects every `migration/*` call; installed on `A2aServer` at
/// construction and replaced with the real `MigrationHandlers` once the rest
/// of the graph (which itself needs the server) exists.
struct PendingMigrationHandler;

#[async_trait]
impl MigrationHandler for PendingMigrationHandler {
    async fn handle(&self, method: &str, _params: Value) -> Result<Value, TransportError> {
        Err(TransportError::Internal(format!("migration handler not yet installed for {method}")))
    }
}

/// The LLM session itself is out of scope (spec.md "OUT OF SCOPE"): this
/// placeholder always times out so the executor's failure path is
/// exercised until a real `SessionSend` is wired in.
struct UnavailableSession;

#[async_trait]
impl SessionSend for UnavailableSession {
    async fn send(&self, _agent_id: &crate::AgentId, _text: &str, _session_key: Option<&str>) -> Option<String> {
        None
    }
}

/// Every long-lived component a running node owns, assembled by [`build`].
pub struct Node {
    pub config: NodeConfig,
    pub server: Arc<A2aServer>,
    pub client: Arc<A2aClient>,
    pub cards: Arc<CardRegistry>,
    pub node_registry: Arc<NodeRegistry>,
    pub executor: Arc<Executor>,
    pub migration_engine: Arc<MigrationEngine>,
    pub channels: Arc<dyn ChannelStore>,
    pub channel_messages: Arc<dyn ChannelMessageStore>,
    pub bridges: Arc<dyn BridgeStore>,
    pub inbound: Arc<InboundBridge>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    scheduler_handle: JoinHandle<()>,
    triage_sweeper_handle: JoinHandle<()>,
}

async fn sqlite_pool(path: &PathBuf) -> crate::Result<sqlx::SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
    Ok(pool)
}

/// Build every store, registry, and transport component for `config`,
/// wiring the A2A server's migration handler in after the engine that needs
/// the server's own client exists (see [`PendingMigrationHandler`]).
pub async fn build(config: NodeConfig) -> crate::Result<Node> {
    let http = reqwest::Client::new();
    let node_id: crate::NodeId = config.node_id.clone().into();

    let (tasks, audit, tickets, assignments, channels, channel_messages, bridges): (
        Arc<dyn TaskStore>,
        Arc<dyn AuditLog>,
        Arc<dyn TicketStore>,
        Arc<dyn AssignmentStore>,
        Arc<dyn ChannelStore>,
        Arc<dyn ChannelMessageStore>,
        Arc<dyn BridgeStore>,
    ) = match config.store_backend {
        StoreBackend::Memory => (
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryAuditLog::new()),
            Arc::new(InMemoryTicketStore::new()),
            Arc::new(InMemoryAssignmentStore::new()),
            Arc::new(InMemoryChannelStore::new()),
            Arc::new(InMemoryChannelMessageStore::new()),
            Arc::new(InMemoryBridgeStore::new()),
        ),
        StoreBackend::Sqlite => {
            let path = config
                .sqlite_path
                .clone()
                .ok_or_else(|| ConfigError::MissingKey("sqlite_path".into()))?;
            let pool = sqlite_pool(&path).await?;

            let tasks = SqliteTaskStore::new(pool.clone());
            tasks.migrate().await?;
            let audit = SqliteAuditLog::new(pool.clone());
            audit.migrate().await?;
            let tickets = SqliteTicketStore::new(pool.clone());
            tickets.migrate().await?;
            let assignments = SqliteAssignmentStore::new(pool.clone());
            assignments.migrate().await?;
            let channels = SqliteChannelStore::new(pool.clone());
            channels.migrate().await?;
            let channel_messages = SqliteChannelMessageStore::new(pool.clone());
            channel_messages.migrate().await?;
            let bridges = SqliteBridgeStore::new(pool.clone());
            bridges.migrate().await?;

            (
                Arc::new(tasks),
                Arc::new(audit),
                Arc::new(tickets),
                Arc::new(assignments),
                Arc::new(channels),
                Arc::new(channel_messages),
                Arc::new(bridges),
            )
        }
    };

    let node_registry = Arc::new(NodeRegistry::new(config.parent.clone(), http.clone()));
    let cards = Arc::new(CardRegistry::new());
    let triage = Arc::new(TriageCapture::new(config.triage_expiry()));
    let executor = Arc::new(Executor::new(
        tasks.clone(),
        triage.clone(),
        Arc::new(UnavailableSession),
        audit.clone(),
        config.response_timeout(),
    ));

    let pending: Arc<dyn MigrationHandler> = Arc::new(PendingMigrationHandler);
    let server = Arc::new(A2aServer::new(cards.clone(), executor.clone(), pending));

    let client = Arc::new(A2aClient::new(
        server.clone(),
        node_registry.clone(),
        node_id.clone(),
        config.topology(),
        http.clone(),
        config.remote_timeout(),
    ));

    let migration_engine = Arc::new(MigrationEngine::new(
        tickets,
        assignments,
        audit,
        client.clone(),
        node_id.clone(),
        PathBuf::from(&config.base_path),
    ));
    let migration_handlers: Arc<dyn MigrationHandler> = Arc::new(MigrationHandlers::new(migration_engine.clone()));
    server.set_migration_handler(migration_handlers);

    let inbound = Arc::new(InboundBridge::new(
        bridges.clone(),
        channels.clone(),
        channel_messages.clone(),
        http.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(Scheduler::new(channels.clone(), tasks, config.scheduler_interval()));
    let scheduler_handle = scheduler.spawn(shutdown_rx.clone());
    let triage_sweeper_handle = triage::spawn_sweeper(triage, config.triage_expiry());

    Ok(Node {
        config,
        server,
        client,
        cards,
        node_registry,
        executor,
        migration_engine,
        channels,
        channel_messages,
        bridges,
        inbound,
        shutdown_tx,
        shutdown_rx,
        scheduler_handle,
        triage_sweeper_handle,
    })
}

impl Node {
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Signal shutdown to every component watching the node's shutdown
    /// channel, then abort the background sweep tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.scheduler_handle.abort();
        self.triage_sweeper_handle.abort();
    }
}
