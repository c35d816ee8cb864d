//! Flock: a multi-agent swarm control plane.
//!
//! A set of cooperating, per-node runtimes that host named LLM-backed agents,
//! route structured messages among them across a mesh of nodes, preserve
//! per-agent context and work artifacts, and migrate running agents between
//! nodes without losing state.

pub mod a2a;
pub mod agent_card;
pub mod assignment;
pub mod audit;
pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod migration;
pub mod node;
pub mod node_registry;
pub mod retry;
pub mod scheduler;
pub mod tasks;
pub mod triage;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque agent identifier, unique within the mesh.
pub type AgentId = Arc<str>;

/// Opaque node identifier, unique within the mesh.
pub type NodeId = Arc<str>;

/// Channel identifier (agent/human collaboration space).
pub type ChannelId = Arc<str>;

/// Migration ticket identifier.
pub type MigrationId = Arc<str>;

/// Task record identifier.
pub type TaskId = Arc<str>;

/// Bridge mapping identifier.
pub type BridgeId = Arc<str>;

/// The agent's role within the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Sysadmin,
    Worker,
    System,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Sysadmin => "sysadmin",
            AgentRole::Worker => "worker",
            AgentRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "orchestrator" => Some(AgentRole::Orchestrator),
            "sysadmin" => Some(AgentRole::Sysadmin),
            "worker" => Some(AgentRole::Worker),
            "system" => Some(AgentRole::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The canonical identity of an agent's residency at a point in time:
/// `"{agentId}@{nodeId}"`. Always derived, never stored redundantly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HomeId(String);

impl HomeId {
    pub fn new(agent_id: &str, node_id: &str) -> Self {
        Self(format!("{agent_id}@{node_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a home id back into `(agent_id, node_id)`.
    ///
    /// Agent ids are opaque strings and may not themselves contain `@`, so the
    /// split is unambiguous on the *first* `@`.
    pub fn parse(value: &str) -> Option<(String, String)> {
        let (agent, node) = value.split_once('@')?;
        if agent.is_empty() || node.is_empty() {
            return None;
        }
        Some((agent.to_string(), node.to_string()))
    }
}

impl std::fmt::Display for HomeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-channel, per-agent wakeup state driving the periodic scheduler and
/// inbound `@mention` handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLoopState {
    Sleep,
    Awake,
}

/// Audit severity levels, assigned at every transport/agent/migration/bridge
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    #[default]
    Green,
    Yellow,
    Red,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Green => "GREEN",
            AuditLevel::Yellow => "YELLOW",
            AuditLevel::Red => "RED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GREEN" => Some(AuditLevel::Green),
            "YELLOW" => Some(AuditLevel::Yellow),
            "RED" => Some(AuditLevel::Red),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_id_round_trips() {
        let home = HomeId::new("worker-alpha", "node-1");
        assert_eq!(home.as_str(), "worker-alpha@node-1");
        assert_eq!(
            HomeId::parse(home.as_str()),
            Some(("worker-alpha".to_string(), "node-1".to_string()))
        );
    }

    #[test]
    fn home_id_parse_rejects_missing_parts() {
        assert_eq!(HomeId::parse("no-at-sign"), None);
        assert_eq!(HomeId::parse("@node-1"), None);
        assert_eq!(HomeId::parse("agent@"), None);
    }
}
