//! Periodic liveness sweep over AWAKE channel members (spec.md §5).
//!
//! This is not a work-generation loop — the system doesn't run an LLM loop
//! itself (out of scope). On each tick it walks every non-archived channel,
//! and for every agent currently AWAKE in that channel, confirms the
//! executor has a live task record rather than a stranded `submitted` one.

use crate::channel::store::ChannelStore;
use crate::tasks::store::{TaskStatus, TaskStore};
use crate::AgentLoopState;
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Runs the sweep on a fixed interval until `shutdown` is signaled.
pub struct Scheduler {
    channels: Arc<dyn ChannelStore>,
    tasks: Arc<dyn TaskStore>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(channels: Arc<dyn ChannelStore>, tasks: Arc<dyn TaskStore>, tick: Duration) -> Self {
        Self { channels, tasks, tick }
    }

    /// Spawn the sweep loop. Returns the handle so the caller can abort it
    /// on shutdown; the loop also exits on its own once `shutdown_rx` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = self.sweep().await {
                            tracing::warn!(%error, "liveness sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn sweep(&self) -> crate::Result<()> {
        let channels = self.channels.list().await?;
        for channel in channels {
            if channel.archived {
                continue;
            }
            for (agent_id, state) in &channel.agent_loop_states {
                if *state != AgentLoopState::Awake {
                    continue;
                }
                let tasks = self.tasks.list_by_agent(agent_id).await?;
                let stranded = tasks.iter().filter(|t| t.status == TaskStatus::Submitted).count();
                if stranded > 0 {
                    tracing::debug!(
                        channel_id = %channel.id,
                        agent_id = %agent_id,
                        stranded,
                        "awake agent has submitted tasks awaiting pickup"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::store::InMemoryChannelStore;
    use crate::tasks::store::{CreateTaskInput, InMemoryTaskStore};
    use serde_json::json;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn sweep_tolerates_empty_channels() {
        let channels = Arc::new(InMemoryChannelStore::new());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let scheduler = Scheduler::new(channels, tasks, StdDuration::from_secs(5));
        scheduler.sweep().await.unwrap();
    }

    #[tokio::test]
    async fn sweep_observes_stranded_submitted_tasks_without_erroring() {
        let channels = Arc::new(InMemoryChannelStore::new());
        let tasks = Arc::new(InMemoryTaskStore::new());

        let channel_id: crate::ChannelId = "chan-1".into();
        channels.create(channel_id.clone(), "General".into()).await.unwrap();
        channels
            .set_loop_state(&channel_id, "worker-a".into(), AgentLoopState::Awake)
            .await
            .unwrap();
        tasks
            .create(CreateTaskInput {
                id: "task-1".into(),
                context_id: "ctx-1".into(),
                agent_id: "worker-a".into(),
                channel_id: Some(channel_id.clone()),
                session_key: None,
                request: json!({"text": "hi"}),
            })
            .await
            .unwrap();

        let scheduler = Scheduler::new(channels, tasks, StdDuration::from_secs(5));
        scheduler.sweep().await.unwrap();
    }
}
