pub mod local;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::TaskStatus;

/// Request shape accepted by `submit_task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub role: Option<String>,
    pub description: String,
    pub context: std::collections::HashMap<String, String>,
    pub session_id: Option<String>,
}

/// Adapter-agnostic view of a task's state, returned by every adapter
/// operation so callers never need to know which transport is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub id: String,
    pub name: String,
}

/// One value of a task's update stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: String,
    pub status: TaskStatus,
    pub progress: u8,
}

/// A lazy, finite sequence of task updates: one value per observed status
/// change, completing when a terminal state is observed.
#[async_trait]
pub trait UpdateIterator: Send {
    async fn next(&mut self) -> Result<Option<TaskUpdate>>;
}

/// The main polymorphic surface of the system. Two implementations coexist
/// (local, remote); future implementations (message-bus, in-cluster RPC) must
/// satisfy the same contract.
///
/// `submit_task` MUST return a created task whose status is `pending` before
/// the adapter begins execution; actual execution MUST begin asynchronously.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    async fn submit_task(&self, req: SubmitTaskRequest) -> Result<TaskState>;
    async fn stream_task_updates(&self, id: &str) -> Result<Box<dyn UpdateIterator>>;
    async fn query_task_state(&self, id: &str) -> Result<Option<TaskState>>;
    async fn cancel_task(&self, id: &str) -> Result<bool>;
    async fn list_agents(&self) -> Result<Vec<AgentInfo>>;
    async fn list_skills(&self) -> Result<Vec<SkillInfo>>;
    async fn close(&self) -> Result<()>;
}
