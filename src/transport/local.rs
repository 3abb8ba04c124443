use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::TaskEngine;
use crate::error::Result;
use crate::models::TaskStatus;
use crate::transport::{
    AgentInfo, SkillInfo, SubmitTaskRequest, TaskState, TaskUpdate, TransportAdapter,
    UpdateIterator,
};

/// Outcome of a subagent-spawn call.
#[derive(Debug, Clone)]
pub enum SpawnOutcome {
    Accepted { child_session_key: Option<String> },
    Rejected { error: String },
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: String,
    pub label: String,
    pub agent_id: String,
    pub model: Option<String>,
    pub thinking: Option<String>,
}

/// External collaborator that actually executes a task's work. Must be
/// callable re-entrantly — the orchestrator and the local transport both
/// hold references to it.
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    async fn spawn(&self, req: SpawnRequest) -> Result<SpawnOutcome>;
}

/// Default `SubagentSpawner` that shells out to the `claude` CLI binary, the
/// same way the Claude Code CLI client locates and invokes it. Discovery
/// happens once at construction.
pub struct ClaudeCliSubagentSpawner {
    claude_binary: String,
}

impl ClaudeCliSubagentSpawner {
    pub async fn new() -> Result<Self> {
        let claude_binary = Self::find_claude_binary().await?;
        Ok(Self { claude_binary })
    }

    pub fn with_binary(claude_binary: impl Into<String>) -> Self {
        Self {
            claude_binary: claude_binary.into(),
        }
    }

    async fn find_claude_binary() -> Result<String> {
        let candidates = ["claude", "/usr/local/bin/claude", "/home/vscode/.local/bin/claude"];
        for path in candidates {
            match tokio::process::Command::new(path).arg("--help").output().await {
                Ok(output) if output.status.success() => return Ok(path.to_string()),
                _ => continue,
            }
        }
        Err(crate::error::SpiralError::ConfigurationError(
            "claude CLI binary not found on PATH or in standard install locations".to_string(),
        ))
    }
}

#[async_trait]
impl SubagentSpawner for ClaudeCliSubagentSpawner {
    async fn spawn(&self, req: SpawnRequest) -> Result<SpawnOutcome> {
        let output = tokio::process::Command::new(&self.claude_binary)
            .arg("-p")
            .arg(&req.task)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => Ok(SpawnOutcome::Accepted {
                child_session_key: Some(uuid::Uuid::new_v4().to_string()),
            }),
            Ok(out) => Ok(SpawnOutcome::Rejected {
                error: String::from_utf8_lossy(&out.stderr).to_string(),
            }),
            Err(e) => Ok(SpawnOutcome::Rejected { error: e.to_string() }),
        }
    }
}

struct EngineUpdateIterator {
    stream: crate::engine::UpdateStream,
}

#[async_trait]
impl UpdateIterator for EngineUpdateIterator {
    async fn next(&mut self) -> Result<Option<TaskUpdate>> {
        match self.stream.next().await {
            Some(event) => Ok(Some(TaskUpdate {
                id: event.task_id,
                status: event.new_status.unwrap_or(TaskStatus::Pending),
                progress: 0,
            })),
            None => Ok(None),
        }
    }
}

fn success_sentinel() -> String {
    "accepted".to_string()
}

/// In-process execution adapter: dispatches via the Task Engine and a
/// background worker per task.
pub struct LocalTransportAdapter {
    engine: Arc<TaskEngine>,
    spawner: Arc<dyn SubagentSpawner>,
    agents: Vec<AgentInfo>,
    skills: Vec<SkillInfo>,
}

impl LocalTransportAdapter {
    pub fn new(
        engine: Arc<TaskEngine>,
        spawner: Arc<dyn SubagentSpawner>,
        agents: Vec<AgentInfo>,
        skills: Vec<SkillInfo>,
    ) -> Self {
        Self {
            engine,
            spawner,
            agents,
            skills,
        }
    }

    async fn run(engine: Arc<TaskEngine>, spawner: Arc<dyn SubagentSpawner>, task_id: String, role: Option<String>, description: String) {
        if engine.update_status(&task_id, TaskStatus::Planning).await.is_err() {
            return;
        }
        if engine.update_status(&task_id, TaskStatus::Running).await.is_err() {
            return;
        }

        let req = SpawnRequest {
            task: description,
            label: task_id.clone(),
            agent_id: role.unwrap_or_else(|| "code-creator".to_string()),
            model: None,
            thinking: None,
        };

        match spawner.spawn(req).await {
            Ok(SpawnOutcome::Accepted { .. }) => {
                let _ = engine.set_output(&task_id, success_sentinel()).await;
                let _ = engine.update_status(&task_id, TaskStatus::Completed).await;
                info!(task_id = %task_id, "local task completed");
            }
            Ok(SpawnOutcome::Rejected { error }) => {
                let _ = engine.set_error(&task_id, error).await;
            }
            Err(e) => {
                let _ = engine.set_error(&task_id, e.to_string()).await;
                warn!(task_id = %task_id, "subagent spawn call failed");
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for LocalTransportAdapter {
    async fn submit_task(&self, req: SubmitTaskRequest) -> Result<TaskState> {
        let task = self.engine.create_task(req.description.clone(), req.role.clone()).await?;

        let engine = self.engine.clone();
        let spawner = self.spawner.clone();
        let task_id = task.id.clone();
        let role = req.role;
        let description = req.description;
        tokio::spawn(async move {
            Self::run(engine, spawner, task_id, role, description).await;
        });

        Ok(TaskState {
            id: task.id,
            status: task.status,
            progress: task.progress,
            output: task.output,
            error: task.error,
        })
    }

    async fn stream_task_updates(&self, id: &str) -> Result<Box<dyn UpdateIterator>> {
        let stream = self.engine.stream_updates(id).await?;
        Ok(Box::new(EngineUpdateIterator { stream }))
    }

    async fn query_task_state(&self, id: &str) -> Result<Option<TaskState>> {
        Ok(self.engine.get(id).await?.map(|t| TaskState {
            id: t.id,
            status: t.status,
            progress: t.progress,
            output: t.output,
            error: t.error,
        }))
    }

    async fn cancel_task(&self, id: &str) -> Result<bool> {
        self.engine.cancel(id).await
    }

    async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        Ok(self.agents.clone())
    }

    async fn list_skills(&self) -> Result<Vec<SkillInfo>> {
        Ok(self.skills.clone())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;

    struct AlwaysAccept;
    #[async_trait]
    impl SubagentSpawner for AlwaysAccept {
        async fn spawn(&self, _req: SpawnRequest) -> Result<SpawnOutcome> {
            Ok(SpawnOutcome::Accepted { child_session_key: None })
        }
    }

    struct AlwaysReject;
    #[async_trait]
    impl SubagentSpawner for AlwaysReject {
        async fn spawn(&self, _req: SpawnRequest) -> Result<SpawnOutcome> {
            Ok(SpawnOutcome::Rejected { error: "nope".to_string() })
        }
    }

    #[tokio::test]
    async fn submit_task_returns_pending_before_execution_begins() {
        let engine = Arc::new(TaskEngine::new(Arc::new(InMemoryTaskStore::new())));
        let adapter = LocalTransportAdapter::new(engine, Arc::new(AlwaysAccept), vec![], vec![]);
        let state = adapter
            .submit_task(SubmitTaskRequest {
                role: Some("code-creator".to_string()),
                description: "build it".to_string(),
                context: HashMap::new(),
                session_id: None,
            })
            .await
            .unwrap();
        assert_eq!(state.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn accepted_spawn_completes_task() {
        let engine = Arc::new(TaskEngine::new(Arc::new(InMemoryTaskStore::new())));
        let adapter = LocalTransportAdapter::new(engine.clone(), Arc::new(AlwaysAccept), vec![], vec![]);
        let state = adapter
            .submit_task(SubmitTaskRequest {
                role: None,
                description: "build it".to_string(),
                context: HashMap::new(),
                session_id: None,
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if let Some(t) = engine.get(&state.id).await.unwrap() {
                if t.status.is_terminal() {
                    assert_eq!(t.status, TaskStatus::Completed);
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task never reached terminal state");
    }

    #[tokio::test]
    async fn rejected_spawn_fails_task() {
        let engine = Arc::new(TaskEngine::new(Arc::new(InMemoryTaskStore::new())));
        let adapter = LocalTransportAdapter::new(engine.clone(), Arc::new(AlwaysReject), vec![], vec![]);
        let state = adapter
            .submit_task(SubmitTaskRequest {
                role: None,
                description: "build it".to_string(),
                context: HashMap::new(),
                session_id: None,
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if let Some(t) = engine.get(&state.id).await.unwrap() {
                if t.status.is_terminal() {
                    assert_eq!(t.status, TaskStatus::Failed);
                    assert_eq!(t.error.as_deref(), Some("nope"));
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task never reached terminal state");
    }
}
