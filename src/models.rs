use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::ids::new_id;

/// Current status of a task in the lifecycle state machine.
///
/// The seven strings are part of the wire and CLI surface and must be
/// preserved verbatim (see the orchestrator's remote transport and API
/// layers, which serialize this with `#[serde(rename_all = "snake_case")]`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether `self -> target` is a legal transition per the state table.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Planning)
                | (Pending, Cancelled)
                | (Planning, Running)
                | (Planning, Failed)
                | (Planning, Cancelled)
                | (Running, Waiting)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Waiting, Running)
                | (Waiting, Failed)
                | (Waiting, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// A unit of work tracked by the lifecycle state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub description: String,
    pub role: Option<String>,
    pub session_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub progress: u8,
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(description: String, role: Option<String>) -> Self {
        Self {
            id: new_id(),
            status: TaskStatus::Pending,
            description,
            role,
            session_id: None,
            parent_task_id: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            progress: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One entry in a task's append-only event journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: TaskEventKind,
    pub old_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    StatusChanged,
    ProgressUpdated,
    OutputAdded,
    ErrorSet,
}

/// One step of a workflow definition, as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub role: String,
    pub description: String,
    pub dependencies: Vec<String>,
}

impl Step {
    pub fn new(role: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            description: description.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on(mut self, description: impl Into<String>) -> Self {
        self.dependencies.push(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A DAG of tasks with dependency edges.
///
/// `prerequisites[t]` is the set of task ids that must be terminal before `t`
/// can leave `Pending`; `dependents[t]` is the inverse edge set, kept for
/// impact queries.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub status: WorkflowStatus,
    pub tasks: HashMap<String, Task>,
    /// Submission order, by task id — mirrors the order steps were given.
    pub task_order: Vec<String>,
    pub prerequisites: HashMap<String, HashSet<String>>,
    pub dependents: HashMap<String, HashSet<String>>,
}

impl Workflow {
    pub fn new() -> Self {
        Self {
            id: new_id(),
            status: WorkflowStatus::Pending,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            prerequisites: HashMap::new(),
            dependents: HashMap::new(),
        }
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_allows_planning_and_cancel_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Planning));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn waiting_can_resume_to_running() {
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for target in [
                TaskStatus::Pending,
                TaskStatus::Planning,
                TaskStatus::Running,
                TaskStatus::Waiting,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn new_task_starts_pending_with_clamped_progress() {
        let task = Task::new("do the thing".to_string(), Some("code-creator".to_string()));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }
}
