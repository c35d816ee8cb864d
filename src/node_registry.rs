//! Node registry with hierarchical (parent-registry-backed) lookup.

use crate::config::ParentConfig;
use crate::{AgentId, NodeId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Node status as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

/// A node entry. `agent_ids` is the *known* set — absence of an id is
/// non-authoritative unless reconfirmed (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub a2a_endpoint: String,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    pub agent_ids: Vec<AgentId>,
}

impl NodeEntry {
    pub fn is_synthetic(&self) -> bool {
        self.node_id.starts_with("parent-resolved-")
    }
}

/// Result of a hierarchical agent lookup: the resolved entry, and whether it
/// was served from (or originated at) the parent registry.
#[derive(Debug, Clone)]
pub struct AgentLookup {
    pub entry: NodeEntry,
    pub from_parent: bool,
}

/// `{cachedAt, nodeId}` keyed by agentId (spec.md §3), backed by an LRU+TTL
/// cache. The TTL/capacity bound resolves the spec's open question about
/// unbounded parent-cache growth (SPEC_FULL.md §4.5).
#[derive(Clone)]
struct ParentCache {
    cache: Cache<AgentId, NodeId>,
}

impl ParentCache {
    fn new(ttl: std::time::Duration, capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
        }
    }
}

/// Directory discovery response shape, as returned by
/// `GET {endpoint}/.well-known/agent-card.json`.
#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    agents: Vec<DirectoryAgent>,
}

#[derive(Debug, Deserialize)]
struct DirectoryAgent {
    id: String,
    url: String,
}

/// Local node map plus an optional parent-registry fallback.
pub struct NodeRegistry {
    nodes: DashMap<NodeId, NodeEntry>,
    parent_cache: ParentCache,
    parent: Option<ParentConfig>,
    http: reqwest::Client,
}

impl NodeRegistry {
    pub fn new(parent: Option<ParentConfig>, http: reqwest::Client) -> Self {
        let (ttl, capacity) = parent
            .as_ref()
            .map(|p| (p.cache_ttl(), p.cache_capacity))
            .unwrap_or((std::time::Duration::from_secs(300), 10_000));
        Self {
            nodes: DashMap::new(),
            parent_cache: ParentCache::new(ttl, capacity),
            parent,
            http,
        }
    }

    pub fn register(&self, entry: NodeEntry) {
        self.nodes.insert(entry.node_id.clone(), entry);
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.nodes.remove(node_id);
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeEntry> {
        self.nodes.get(node_id).map(|e| e.clone())
    }

    /// Node-local mutation: merge new agent ids into the known set.
    pub fn update_agents(&self, node_id: &NodeId, agent_ids: Vec<AgentId>) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            for id in agent_ids {
                if !entry.agent_ids.contains(&id) {
                    entry.agent_ids.push(id);
                }
            }
        }
    }

    /// Node-local mutation: `status = online` bumps `last_seen`.
    pub fn update_status(&self, node_id: &NodeId, status: NodeStatus) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.status = status;
            if status == NodeStatus::Online {
                entry.last_seen = Utc::now();
            }
        }
    }

    /// Hierarchical lookup (spec.md §4.5):
    /// 1. Local scan; if a parent-cache record exists and is stale,
    ///    revalidate against the parent.
    /// 2. Not found locally: fall through to the parent directory.
    pub async fn find_node_for_agent_with_parent(
        &self,
        agent_id: &AgentId,
    ) -> Option<AgentLookup> {
        if let Some(node_id) = self.local_node_for_agent(agent_id) {
            if self.parent_cache.cache.get(agent_id).is_some() {
                // Cached mapping exists; moka enforces the TTL for us, so a
                // cache hit here means it's still fresh. A cache miss below
                // means it expired and needs revalidation.
                if let Some(entry) = self.get(&node_id) {
                    return Some(AgentLookup {
                        entry,
                        from_parent: true,
                    });
                }
            } else if let Some(entry) = self.get(&node_id) {
                // Never parent-cached (locally registered node) — authoritative.
                return Some(AgentLookup {
                    entry,
                    from_parent: false,
                });
            }

            // Cache entry expired (or the node entry vanished): revalidate.
            return self.revalidate_with_parent(agent_id, &node_id).await;
        }

        self.query_parent_and_cache(agent_id).await
    }

    /// Used when a delivery to `expected_node_id` reports the agent missing:
    /// evict the cached mapping and re-query the parent.
    pub async fn validate_agent(
        &self,
        agent_id: &AgentId,
        expected_node_id: &NodeId,
    ) -> Option<AgentLookup> {
        self.evict_agent_from_node(agent_id, expected_node_id);

        let fresh = self.query_parent_and_cache(agent_id).await;
        match fresh {
            Some(lookup) if lookup.entry.node_id == *expected_node_id => Some(lookup),
            other => other,
        }
    }

    fn local_node_for_agent(&self, agent_id: &AgentId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|entry| entry.agent_ids.contains(agent_id))
            .map(|entry| entry.node_id.clone())
    }

    async fn revalidate_with_parent(
        &self,
        agent_id: &AgentId,
        cached_node_id: &NodeId,
    ) -> Option<AgentLookup> {
        let Some(parent) = &self.parent else {
            self.evict_agent_from_node(agent_id, cached_node_id);
            return None;
        };

        match self.fetch_parent_directory(parent).await {
            Ok(directory) => match directory.into_iter().find(|a| a.id == **agent_id) {
                Some(agent) => {
                    let node_id = self.cache_parent_entry(agent_id, &agent);
                    if node_id != *cached_node_id {
                        self.evict_agent_from_node(agent_id, cached_node_id);
                    }
                    self.get(&node_id).map(|entry| AgentLookup {
                        entry,
                        from_parent: true,
                    })
                }
                None => {
                    // Parent no longer knows this agent: evict.
                    self.evict_agent_from_node(agent_id, cached_node_id);
                    None
                }
            },
            Err(error) => {
                // Graceful parent failure: log + return null, never raise
                // (spec.md §9 "Graceful parent failure").
                tracing::warn!(%error, %agent_id, "parent revalidation failed");
                None
            }
        }
    }

    async fn query_parent_and_cache(&self, agent_id: &AgentId) -> Option<AgentLookup> {
        let parent = self.parent.as_ref()?;
        match self.fetch_parent_directory(parent).await {
            Ok(directory) => {
                let agent = directory.into_iter().find(|a| a.id == **agent_id)?;
                let node_id = self.cache_parent_entry(agent_id, &agent);
                self.get(&node_id).map(|entry| AgentLookup {
                    entry,
                    from_parent: true,
                })
            }
            Err(error) => {
                tracing::warn!(%error, %agent_id, "parent lookup failed");
                None
            }
        }
    }

    async fn fetch_parent_directory(
        &self,
        parent: &ParentConfig,
    ) -> anyhow::Result<Vec<DirectoryAgent>> {
        let url = format!("{}/.well-known/agent-card.json", parent.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(parent.timeout())
            .send()
            .await?
            .error_for_status()?;
        let directory: DirectoryResponse = response.json().await?;
        Ok(directory.agents)
    }

    /// Derive the base endpoint from an agent's full URL by stripping the
    /// `/a2a/{agentId}` suffix (supports nested base paths), insert a
    /// synthetic node entry, and record the parent-cache mapping.
    fn cache_parent_entry(&self, agent_id: &AgentId, agent: &DirectoryAgent) -> NodeId {
        let endpoint = strip_a2a_suffix(&agent.url, &agent.id);
        let node_id: NodeId = format!("parent-resolved-{endpoint}").into();

        self.nodes
            .entry(node_id.clone())
            .and_modify(|entry| {
                if !entry.agent_ids.contains(agent_id) {
                    entry.agent_ids.push(agent_id.clone());
                }
                entry.status = NodeStatus::Online;
                entry.last_seen = Utc::now();
            })
            .or_insert_with(|| NodeEntry {
                node_id: node_id.clone(),
                a2a_endpoint: endpoint.clone(),
                status: NodeStatus::Online,
                last_seen: Utc::now(),
                agent_ids: vec![agent_id.clone()],
            });

        self.parent_cache.cache.insert(agent_id.clone(), node_id.clone());
        node_id
    }

    /// Evict a cached agent mapping. If the cached node is synthetic and now
    /// has no agents left, delete the node entry too (spec.md §4.5).
    fn evict_agent_from_node(&self, agent_id: &AgentId, node_id: &NodeId) {
        self.parent_cache.cache.invalidate(agent_id);
        let should_remove = if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.agent_ids.retain(|id| id != agent_id);
            entry.is_synthetic() && entry.agent_ids.is_empty()
        } else {
            false
        };
        if should_remove {
            self.nodes.remove(node_id);
        }
    }
}

/// Strip the `/a2a/{agentId}` suffix from an agent's full URL, supporting
/// nested base paths like `/deep/flock`.
fn strip_a2a_suffix(url: &str, agent_id: &str) -> String {
    let suffix = format!("/a2a/{agent_id}");
    url.strip_suffix(&suffix).unwrap_or(url).to_string()
}

pub type SharedNodeRegistry = Arc<NodeRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(node_id: &str, agents: &[&str]) -> NodeEntry {
        NodeEntry {
            node_id: node_id.into(),
            a2a_endpoint: format!("http://{node_id}/flock"),
            status: NodeStatus::Online,
            last_seen: Utc::now(),
            agent_ids: agents.iter().map(|a| (*a).into()).collect(),
        }
    }

    #[test]
    fn strip_a2a_suffix_supports_nested_base_paths() {
        assert_eq!(
            strip_a2a_suffix("http://faraway:4000/deep/flock/a2a/remote-worker", "remote-worker"),
            "http://faraway:4000/deep/flock"
        );
    }

    #[tokio::test]
    async fn local_lookup_is_authoritative_without_parent() {
        let registry = NodeRegistry::new(None, reqwest::Client::new());
        registry.register(entry("node-1", &["worker-beta"]));

        let lookup = registry
            .find_node_for_agent_with_parent(&"worker-beta".into())
            .await
            .expect("should find locally");
        assert_eq!(lookup.entry.node_id.as_ref(), "node-1");
        assert!(!lookup.from_parent);
    }

    #[tokio::test]
    async fn unknown_agent_without_parent_returns_none() {
        let registry = NodeRegistry::new(None, reqwest::Client::new());
        let lookup = registry
            .find_node_for_agent_with_parent(&"ghost".into())
            .await;
        assert!(lookup.is_none());
    }
}
