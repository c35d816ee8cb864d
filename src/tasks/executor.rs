//! Executor: the adapter from an A2A `message/send` request to a pluggable
//! `SessionSend` function, and the task-lifecycle bookkeeping around it
//! (spec.md §4.6).

use crate::a2a::rpc::{self, Artifact, Message, Part};
use crate::audit::{AuditLog, NewAuditEntry};
use crate::error::{Result, StoreError};
use crate::tasks::store::{CreateTaskInput, TaskStatus, TaskStore, UpdateTaskInput};
use crate::triage::TriageCapture;
use crate::{AgentId, AuditLevel, TaskId};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What kind of work a message carries. Only `SysadminRequest` changes the
/// executor's behavior (header prepend, triage capture); the rest are
/// routing/bookkeeping labels a consumer can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlockType {
    SysadminRequest,
    WorkerTask,
    Review,
    SystemOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

impl Urgency {
    fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
        }
    }
}

/// `sessionRouting` in the message's data part, if present and valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRouting {
    pub chat_type: String,
    pub peer_id: String,
}

/// Flock-specific metadata carried in a message's data part. Unknown or
/// invalid fields are dropped rather than rejecting the whole message
/// (spec.md §4.6 step 2).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlockTaskMetadata {
    #[serde(default)]
    pub flock_type: Option<FlockType>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub from_home: Option<String>,
    #[serde(default)]
    pub expected_level: Option<String>,
    #[serde(default)]
    pub session_routing: Option<SessionRouting>,
}

impl FlockTaskMetadata {
    fn is_sysadmin_request(&self) -> bool {
        self.flock_type == Some(FlockType::SysadminRequest)
    }
}

/// The pluggable LLM session adapter the executor treats as opaque
/// (spec.md §4.6). Prompt assembly, model selection, and the session itself
/// are out of scope; this trait is the entire seam.
#[async_trait]
pub trait SessionSend: Send + Sync {
    async fn send(&self, agent_id: &AgentId, text: &str, session_key: Option<&str>) -> Option<String>;
}

/// Drives task lifecycle transitions, adapting an A2A request onto a
/// `SessionSend` and recording the audit trail around it.
pub struct Executor {
    store: Arc<dyn TaskStore>,
    triage: Arc<TriageCapture>,
    session: Arc<dyn SessionSend>,
    audit: Arc<dyn AuditLog>,
    response_timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        triage: Arc<TriageCapture>,
        session: Arc<dyn SessionSend>,
        audit: Arc<dyn AuditLog>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            store,
            triage,
            session,
            audit,
            response_timeout,
        }
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

    /// Accept an inbound message for `agent_id`: create its task record,
    /// prepend the sysadmin-request header if applicable, race `SessionSend`
    /// against `response_timeout`, and render the result (spec.md §4.6
    /// steps 1-9).
    pub async fn submit(&self, agent_id: AgentId, message: Message) -> Result<rpc::Task> {
        let task_id: TaskId = Uuid::new_v4().to_string().into();
        let context_id = message
            .context_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let metadata: FlockTaskMetadata = message
            .first_data()
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or(None)
            .unwrap_or_default();

        let session_key = metadata
            .session_routing
            .as_ref()
            .map(|routing| format!("agent:{agent_id}:flock:{}:{}", routing.chat_type, routing.peer_id));

        let request = serde_json::to_value(&message).map_err(|e| StoreError::Query(e.to_string()))?;

        self.store
            .create(CreateTaskInput {
                id: task_id.clone(),
                context_id: context_id.clone(),
                agent_id: agent_id.clone(),
                channel_id: None,
                session_key: session_key.clone(),
                request,
            })
            .await?;

        self.store
            .update(
                &task_id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Working),
                    ..Default::default()
                },
            )
            .await?;

        let text = message.joined_text();
        let triage_request_id = metadata.is_sysadmin_request().then(synthesize_triage_request_id);
        let send_text = match &triage_request_id {
            Some(request_id) => {
                self.triage.put(
                    request_id.clone(),
                    serde_json::json!({
                        "taskId": task_id.to_string(),
                        "agentId": agent_id.to_string(),
                        "text": text,
                    }),
                );
                let header = format!(
                    "[from: {} | urgency: {} | project: {} | request-id: {}]",
                    metadata.from_home.as_deref().unwrap_or("unknown"),
                    metadata.urgency.as_str(),
                    metadata.project.as_deref().unwrap_or("none"),
                    request_id,
                );
                format!("{header} {text}")
            }
            None => text,
        };

        let outcome = tokio::time::timeout(
            self.response_timeout,
            self.session.send(&agent_id, &send_text, session_key.as_deref()),
        )
        .await;

        let response_text = match outcome {
            Ok(Some(text)) => text,
            Ok(None) | Err(_) => {
                let failed = self
                    .fail_task(&task_id, "session produced no response within the timeout")
                    .await?;
                self.log(&agent_id, "task.fail", AuditLevel::Red, "session timed out or returned no response").await;
                return Ok(failed);
            }
        };

        let (artifact, level) = match triage_request_id.as_deref().and_then(|id| self.triage.take(id)) {
            Some(decision) => (triage_artifact(&decision), triage_level(&decision)),
            None => (response_artifact(&response_text), AuditLevel::Green),
        };

        let response = serde_json::json!({
            "text": response_text,
            "artifacts": [artifact],
        });

        let task = self
            .store
            .update(
                &task_id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Completed),
                    response: Some(response),
                    ..Default::default()
                },
            )
            .await?;
        self.log(&agent_id, "task.complete", level, "task completed").await;
        Ok(to_rpc_task(&task))
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<rpc::Task>> {
        Ok(self.store.get(task_id).await?.as_ref().map(to_rpc_task))
    }

    pub async fn complete_task(&self, task_id: &TaskId, response: Value) -> Result<rpc::Task> {
        let task = self
            .store
            .update(
                task_id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Completed),
                    response: Some(response),
                    ..Default::default()
                },
            )
            .await?;
        Ok(to_rpc_task(&task))
    }

    pub async fn fail_task(&self, task_id: &TaskId, error: impl Into<String>) -> Result<rpc::Task> {
        let task = self
            .store
            .update(
                task_id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Failed),
                    error: Some(error.into()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(to_rpc_task(&task))
    }

    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<()> {
        let task = self
            .store
            .update(
                task_id,
                UpdateTaskInput {
                    status: Some(TaskStatus::Canceled),
                    ..Default::default()
                },
            )
            .await?;
        self.log(&task.agent_id, "task.cancel", AuditLevel::Yellow, "task canceled").await;
        Ok(())
    }

    /// Claim a triage capture by request id, consuming it.
    pub fn take_triage(&self, request_id: &str) -> Option<Value> {
        self.triage.take(request_id)
    }

    /// Poll the store for `task_id` reaching a terminal state, giving up
    /// after the configured response timeout (default 600s, spec.md §4.6).
    pub async fn wait_for_completion(&self, task_id: &TaskId) -> Result<Option<rpc::Task>> {
        let deadline = tokio::time::Instant::now() + self.response_timeout;
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            if let Some(task) = self.store.get(task_id).await? {
                if task.status.is_terminal() {
                    return Ok(Some(to_rpc_task(&task)));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            interval.tick().await;
        }
    }
}

fn synthesize_triage_request_id() -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::random();
    format!("triage-{timestamp}-{suffix:08x}")
}

/// Render the `{level, action, reasoning, riskFactors?, requiresHumanApproval}`
/// triage-result artifact plus a formatted text receipt (spec.md §4.6 step 7).
fn triage_artifact(decision: &Value) -> Artifact {
    let level = decision.get("level").and_then(Value::as_str).unwrap_or("GREEN");
    let action = decision.get("action").and_then(Value::as_str).unwrap_or("");
    let reasoning = decision.get("reasoning").and_then(Value::as_str).unwrap_or("");
    let risk_factors = decision.get("riskFactors").cloned();
    let requires_human_approval = level == "RED";

    let mut data = serde_json::json!({
        "level": level,
        "action": action,
        "reasoning": reasoning,
        "requiresHumanApproval": requires_human_approval,
    });
    if let Some(risk_factors) = risk_factors {
        data["riskFactors"] = risk_factors;
    }

    let receipt = format!("[{level}] {action}: {reasoning}");
    Artifact {
        name: "triage-result".into(),
        parts: vec![Part::Data { data }, Part::Text { text: receipt }],
    }
}

fn triage_level(decision: &Value) -> AuditLevel {
    decision
        .get("level")
        .and_then(Value::as_str)
        .and_then(AuditLevel::parse)
        .unwrap_or(AuditLevel::Green)
}

fn response_artifact(response_text: &str) -> Artifact {
    Artifact {
        name: "response".into(),
        parts: vec![Part::Text { text: response_text.to_string() }],
    }
}

fn to_rpc_task(task: &crate::tasks::store::Task) -> rpc::Task {
    let status = match task.status {
        TaskStatus::Submitted => rpc::TaskState::Submitted,
        TaskStatus::Working => rpc::TaskState::Working,
        TaskStatus::InputRequired => rpc::TaskState::InputRequired,
        TaskStatus::Completed => rpc::TaskState::Completed,
        TaskStatus::Canceled => rpc::TaskState::Canceled,
        TaskStatus::Failed => rpc::TaskState::Failed,
    };
    let artifacts = task
        .response
        .as_ref()
        .and_then(|response| response.get("artifacts"))
        .cloned()
        .and_then(|value| serde_json::from_value::<Vec<Artifact>>(value).ok())
        .unwrap_or_default();
    rpc::Task {
        task_id: task.id.to_string(),
        context_id: task.context_id.clone(),
        status,
        artifacts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::rpc::Part;
    use crate::audit::InMemoryAuditLog;
    use crate::tasks::store::InMemoryTaskStore;
    use std::sync::Mutex;

    /// Echoes a fixed response, or `None` for agents whose id ends in
    /// `-silent`, to exercise the timeout/null-response path without an
    /// actual timer.
    struct EchoSession {
        response: Option<String>,
    }

    #[async_trait]
    impl SessionSend for EchoSession {
        async fn send(&self, agent_id: &AgentId, _text: &str, _session_key: Option<&str>) -> Option<String> {
            if agent_id.as_ref().ends_with("-silent") {
                return None;
            }
            self.response.clone()
        }
    }

    /// Records the exact text handed to `send`, so header-prepend behavior
    /// can be asserted on.
    struct CapturingSession {
        captured: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionSend for CapturingSession {
        async fn send(&self, _agent_id: &AgentId, text: &str, _session_key: Option<&str>) -> Option<String> {
            self.captured.lock().unwrap().push(text.to_string());
            Some("ack".into())
        }
    }

    fn executor(session: Arc<dyn SessionSend>) -> Executor {
        Executor::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(TriageCapture::new(Duration::from_secs(300))),
            session,
            Arc::new(InMemoryAuditLog::new()),
            Duration::from_millis(500),
        )
    }

    fn echo(response: &str) -> Arc<dyn SessionSend> {
        Arc::new(EchoSession { response: Some(response.to_string()) })
    }

    #[tokio::test]
    async fn submit_completes_with_plain_response_artifact() {
        let executor = executor(echo("done"));
        let message = Message::text("user", "please do the thing");
        let task = executor.submit("worker-a".into(), message).await.unwrap();
        assert_eq!(task.status, rpc::TaskState::Completed);
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(task.artifacts[0].name, "response");
    }

    #[tokio::test]
    async fn sysadmin_request_prepends_header_and_clears_triage_capture() {
        let session = Arc::new(CapturingSession { captured: Mutex::new(Vec::new()) });
        let executor = executor(session.clone());
        let message = Message {
            role: "user".into(),
            parts: vec![
                Part::Text { text: "restart please".into() },
                Part::Data {
                    data: serde_json::json!({
                        "flockType": "sysadmin-request",
                        "urgency": "high",
                        "project": "flock",
                        "fromHome": "worker-a@node-1",
                    }),
                },
            ],
            context_id: None,
        };
        let task = executor.submit("sysadmin".into(), message).await.unwrap();
        assert_eq!(task.status, rpc::TaskState::Completed);

        let captured = session.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].starts_with("[from: worker-a@node-1 | urgency: high | project: flock | request-id: triage-"));
        assert!(captured[0].ends_with("restart please"));
    }

    #[tokio::test]
    async fn sysadmin_request_renders_triage_artifact_when_decision_captured() {
        let store = Arc::new(InMemoryTaskStore::new());
        let triage = Arc::new(TriageCapture::new(Duration::from_secs(300)));
        let audit = Arc::new(InMemoryAuditLog::new());

        struct DecidingSession {
            triage: Arc<TriageCapture>,
        }
        #[async_trait]
        impl SessionSend for DecidingSession {
            async fn send(&self, _agent_id: &AgentId, text: &str, _session_key: Option<&str>) -> Option<String> {
                let request_id = text
                    .split("request-id: ")
                    .nth(1)
                    .and_then(|rest| rest.split(']').next())
                    .unwrap()
                    .to_string();
                self.triage.put(
                    request_id,
                    serde_json::json!({
                        "level": "RED",
                        "action": "deny",
                        "reasoning": "destructive command",
                    }),
                );
                Some("handled".into())
            }
        }

        let executor = Executor::new(
            store,
            triage.clone(),
            Arc::new(DecidingSession { triage }),
            audit,
            Duration::from_millis(500),
        );

        let message = Message {
            role: "user".into(),
            parts: vec![
                Part::Text { text: "rm -rf /".into() },
                Part::Data { data: serde_json::json!({ "flockType": "sysadmin-request" }) },
            ],
            context_id: None,
        };
        let task = executor.submit("sysadmin".into(), message).await.unwrap();
        assert_eq!(task.artifacts.len(), 1);
        assert_eq!(task.artifacts[0].name, "triage-result");
        let data = task.artifacts[0].parts[0].as_data().unwrap();
        assert_eq!(data["level"], "RED");
        assert_eq!(data["requiresHumanApproval"], true);
    }

    #[tokio::test]
    async fn null_response_fails_task() {
        let executor = executor(Arc::new(EchoSession { response: None }));
        let message = Message::text("user", "go");
        let task = executor.submit("worker-a".into(), message).await.unwrap();
        assert_eq!(task.status, rpc::TaskState::Failed);
    }

    #[tokio::test]
    async fn complete_task_transitions_to_completed() {
        let executor = executor(echo("ignored"));
        let message = Message::text("user", "go");
        let task = executor.submit("worker-a".into(), message).await.unwrap();
        let task_id: TaskId = task.task_id.into();

        let completed = executor
            .complete_task(&task_id, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(completed.status, rpc::TaskState::Completed);
    }

    #[tokio::test]
    async fn cancel_task_transitions_to_canceled() {
        let executor = executor(echo("ignored"));
        let message = Message::text("user", "go");
        let task = executor.submit("worker-a".into(), message).await.unwrap();
        let task_id: TaskId = task.task_id.into();

        executor.cancel_task(&task_id).await.unwrap();
        let fetched = executor.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, rpc::TaskState::Canceled);
    }
}
