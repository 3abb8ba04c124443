use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::engine::TaskEngine;
use crate::error::{Result, SpiralError};
use crate::ids::new_id;
use crate::models::{Step, Task, TaskStatus, Workflow, WorkflowStatus};
use crate::roles::RoleRegistry;
use crate::transport::local::{SpawnOutcome, SpawnRequest, SubagentSpawner};

const PREREQUISITE_SEPARATOR: &str = "\n---\n";

/// Workflow creation, dependency DAG construction, and the parallel dispatch
/// loop. Owns a map of live workflows; weakly references their tasks by id —
/// task data itself lives in the Task Store behind the engine.
pub struct Orchestrator {
    engine: Arc<TaskEngine>,
    spawner: Arc<dyn SubagentSpawner>,
    roles: Arc<RoleRegistry>,
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<TaskEngine>, spawner: Arc<dyn SubagentSpawner>, roles: Arc<RoleRegistry>) -> Self {
        Self {
            engine,
            spawner,
            roles,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves dependency descriptions against earlier steps' descriptions
    /// (string equality; a collision keeps the later step, a miss is
    /// silently dropped — see DESIGN.md's open-question decision), verifies
    /// the resulting graph is acyclic, then creates one `pending` task per
    /// step. On a cycle, nothing is created and nothing is journaled.
    pub async fn create_workflow(&self, steps: Vec<Step>) -> Result<String> {
        let mut desc_to_index: HashMap<String, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            desc_to_index.insert(step.description.clone(), i);
        }

        let prereq_indices: Vec<HashSet<usize>> = steps
            .iter()
            .map(|step| {
                step.dependencies
                    .iter()
                    .filter_map(|dep| desc_to_index.get(dep).copied())
                    .collect()
            })
            .collect();

        let workflow_id = new_id();
        if has_cycle(&prereq_indices) {
            return Err(SpiralError::WorkflowCyclic(workflow_id));
        }

        let mut tasks = HashMap::new();
        let mut task_order = Vec::with_capacity(steps.len());
        let mut ids_by_index = Vec::with_capacity(steps.len());
        for step in &steps {
            let task = self
                .engine
                .create_task(step.description.clone(), Some(step.role.clone()))
                .await?;
            ids_by_index.push(task.id.clone());
            task_order.push(task.id.clone());
            tasks.insert(task.id.clone(), task);
        }

        let mut prerequisites: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, HashSet<String>> = HashMap::new();
        for (i, prereqs) in prereq_indices.iter().enumerate() {
            let task_id = ids_by_index[i].clone();
            let prereq_ids: HashSet<String> = prereqs.iter().map(|&j| ids_by_index[j].clone()).collect();
            for prereq_id in &prereq_ids {
                dependents.entry(prereq_id.clone()).or_default().insert(task_id.clone());
            }
            prerequisites.insert(task_id, prereq_ids);
        }

        let workflow = Workflow {
            id: workflow_id.clone(),
            status: WorkflowStatus::Pending,
            tasks,
            task_order,
            prerequisites,
            dependents,
        };

        self.workflows.write().await.insert(workflow_id.clone(), workflow);
        Ok(workflow_id)
    }

    pub async fn get_workflow(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().await.get(id).cloned()
    }

    /// Repeatedly computes the ready set, dispatches it in parallel, and
    /// awaits completion before recomputing. Ends the workflow `completed`
    /// if no task failed, `failed` otherwise; fails fast with
    /// `WorkflowStuck` if no task is ready while some remain non-terminal.
    pub async fn execute_workflow(&self, id: &str) -> Result<WorkflowStatus> {
        {
            let mut workflows = self.workflows.write().await;
            let workflow = workflows.get_mut(id).ok_or_else(|| SpiralError::NotFound(id.to_string()))?;
            workflow.status = WorkflowStatus::Running;
        }

        loop {
            let (ready, any_non_terminal) = {
                let workflows = self.workflows.read().await;
                let workflow = workflows.get(id).ok_or_else(|| SpiralError::NotFound(id.to_string()))?;
                self.compute_ready_set(workflow)
            };

            if ready.is_empty() {
                if any_non_terminal {
                    let mut workflows = self.workflows.write().await;
                    if let Some(workflow) = workflows.get_mut(id) {
                        workflow.status = WorkflowStatus::Failed;
                    }
                    return Err(SpiralError::WorkflowStuck(id.to_string()));
                }
                break;
            }

            let dispatches: Vec<_> = ready
                .into_iter()
                .map(|task_id| self.dispatch_one(id, task_id))
                .collect();
            join_all(dispatches).await;

            self.refresh_tasks(id).await?;
        }

        let final_status = {
            let workflows = self.workflows.read().await;
            let workflow = workflows.get(id).ok_or_else(|| SpiralError::NotFound(id.to_string()))?;
            if workflow.tasks.values().any(|t| t.status == TaskStatus::Failed) {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            }
        };

        let mut workflows = self.workflows.write().await;
        if let Some(workflow) = workflows.get_mut(id) {
            workflow.status = final_status;
        }
        Ok(final_status)
    }

    fn compute_ready_set(&self, workflow: &Workflow) -> (Vec<String>, bool) {
        let mut ready = Vec::new();
        let mut any_non_terminal = false;
        for task_id in &workflow.task_order {
            let Some(task) = workflow.tasks.get(task_id) else { continue };
            if !task.status.is_terminal() {
                any_non_terminal = true;
            }
            if task.status != TaskStatus::Pending {
                continue;
            }
            let prereqs = workflow.prerequisites.get(task_id).cloned().unwrap_or_default();
            let satisfied = prereqs.iter().all(|p| {
                workflow.tasks.get(p).map(|t| t.status.is_terminal()).unwrap_or(false)
            });
            if satisfied {
                ready.push(task_id.clone());
            }
        }
        (ready, any_non_terminal)
    }

    async fn dispatch_one(&self, workflow_id: &str, task_id: String) {
        let (description, role, prereq_outputs) = {
            let workflows = self.workflows.read().await;
            let Some(workflow) = workflows.get(workflow_id) else { return };
            let Some(task) = workflow.tasks.get(&task_id) else { return };
            let description = task.description.clone();
            let role = task.role.clone();

            let mut outputs = Vec::new();
            if let Some(prereqs) = workflow.prerequisites.get(&task_id) {
                for prereq_id in prereqs {
                    if let Some(prereq_task) = workflow.tasks.get(prereq_id) {
                        if prereq_task.status == TaskStatus::Completed {
                            if let Some(output) = &prereq_task.output {
                                outputs.push(output.clone());
                            }
                        }
                    }
                }
            }
            (description, role, outputs)
        };

        if self.engine.update_status(&task_id, TaskStatus::Planning).await.is_err() {
            return;
        }
        if self.engine.update_status(&task_id, TaskStatus::Running).await.is_err() {
            return;
        }

        let mut input = description.clone();
        for output in &prereq_outputs {
            input.push_str(PREREQUISITE_SEPARATOR);
            input.push_str(output);
        }

        let agent_id = role.unwrap_or_else(|| "code-creator".to_string());
        let role_meta = self.roles.get(&agent_id);
        let req = SpawnRequest {
            task: input,
            label: description,
            agent_id,
            model: role_meta.map(|r| r.model.clone()),
            thinking: role_meta.map(|r| r.thinking_depth.clone()),
        };

        match self.spawner.spawn(req).await {
            Ok(SpawnOutcome::Accepted { child_session_key }) => {
                if let Some(session_key) = child_session_key {
                    let _ = self.engine.set_session(&task_id, session_key).await;
                }
                let _ = self.engine.set_output(&task_id, "accepted".to_string()).await;
                let _ = self.engine.update_status(&task_id, TaskStatus::Completed).await;
            }
            Ok(SpawnOutcome::Rejected { error }) => {
                let _ = self.engine.set_error(&task_id, error).await;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "subagent spawn call raised; failing task");
                let _ = self.engine.set_error(&task_id, e.to_string()).await;
            }
        }
    }

    async fn refresh_tasks(&self, workflow_id: &str) -> Result<()> {
        let task_ids: Vec<String> = {
            let workflows = self.workflows.read().await;
            match workflows.get(workflow_id) {
                Some(w) => w.task_order.clone(),
                None => return Ok(()),
            }
        };

        let mut refreshed = HashMap::new();
        for task_id in &task_ids {
            if let Some(task) = self.engine.get(task_id).await? {
                refreshed.insert(task_id.clone(), task);
            }
        }

        let mut workflows = self.workflows.write().await;
        if let Some(workflow) = workflows.get_mut(workflow_id) {
            workflow.tasks = refreshed;
        }
        Ok(())
    }

    /// Transitions the workflow and every non-terminal task it owns to
    /// `cancelled`. Does not preempt a task currently inside dispatch — that
    /// task completes or fails as usual, and the cancellation is already
    /// reflected in the record by the time it is observed.
    pub async fn cancel_workflow(&self, id: &str) -> Result<()> {
        let task_ids: Vec<String> = {
            let workflows = self.workflows.read().await;
            let workflow = workflows.get(id).ok_or_else(|| SpiralError::NotFound(id.to_string()))?;
            workflow.task_order.clone()
        };

        for task_id in &task_ids {
            let _ = self.engine.cancel(task_id).await;
        }
        self.refresh_tasks(id).await?;

        let mut workflows = self.workflows.write().await;
        if let Some(workflow) = workflows.get_mut(id) {
            workflow.status = WorkflowStatus::Cancelled;
        }
        info!(workflow_id = %id, "workflow cancelled");
        Ok(())
    }
}

/// Cycle detection by topological reachability (Kahn's algorithm): the
/// graph is acyclic iff every node can be removed by repeatedly stripping
/// nodes with in-degree zero.
fn has_cycle(prereq_indices: &[HashSet<usize>]) -> bool {
    let n = prereq_indices.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (task, prereqs) in prereq_indices.iter().enumerate() {
        in_degree[task] = prereqs.len();
        for &prereq in prereqs {
            dependents[prereq].push(task);
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    visited != n
}
