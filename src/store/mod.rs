use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SpiralError};
use crate::models::{Task, TaskEvent, TaskStatus};

/// Conjunctive filter for `TaskStore::list`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub session_id: Option<String>,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            session_id: None,
        }
    }

    fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if task.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Persistence contract for task records and their event journals.
///
/// The default implementation is in-memory; the contract must also be
/// satisfiable by a durable backend (file, relational, key-value). All reads
/// return deep copies — a caller mutating the result must not mutate stored
/// state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, task: Task) -> Result<()>;
    /// Returns `Ok(None)` for a missing id — `NotFound` is never raised here.
    async fn load(&self, id: &str) -> Result<Option<Task>>;
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn save_event(&self, event: TaskEvent) -> Result<()>;
    async fn get_events(&self, task_id: &str) -> Result<Vec<TaskEvent>>;
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Task>,
    events: HashMap<String, Vec<TaskEvent>>,
}

/// In-memory default `TaskStore`. Every mutation is a whole-record replacement
/// keyed by id, serialized through a single mutex — concurrent writers on
/// different ids do not conflict in effect, only in lock contention.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.lock().await;
        debug!(task_id = %task.id, status = ?task.status, "saving task");
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.tasks.remove(id);
        inner.events.remove(id);
        Ok(())
    }

    async fn save_event(&self, event: TaskEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.events.entry(event.task_id.clone()).or_default().push(event);
        Ok(())
    }

    async fn get_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(task_id).cloned().unwrap_or_default())
    }
}

/// Escalates any lock-poisoning or I/O condition a durable backend might hit.
/// The in-memory store never returns this; it exists for the trait's
/// non-in-memory implementors.
pub fn storage_unavailable(reason: impl Into<String>) -> SpiralError {
    SpiralError::StorageUnavailable(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskEventKind};

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("do the thing".to_string(), None);
        store.save(task.clone()).await.unwrap();

        let loaded = store.load(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.description, task.description);
    }

    #[tokio::test]
    async fn load_missing_returns_none_not_error() {
        let store = InMemoryTaskStore::new();
        assert!(store.load("does-not-exist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_are_conjunctive() {
        let store = InMemoryTaskStore::new();
        let mut a = Task::new("a".to_string(), None);
        a.status = TaskStatus::Running;
        a.session_id = Some("s1".to_string());
        let mut b = Task::new("b".to_string(), None);
        b.status = TaskStatus::Running;
        b.session_id = Some("s2".to_string());
        store.save(a.clone()).await.unwrap();
        store.save(b).await.unwrap();

        let filter = TaskFilter {
            status: Some(TaskStatus::Running),
            session_id: Some("s1".to_string()),
        };
        let results = store.list(&filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, a.id);
    }

    #[tokio::test]
    async fn delete_removes_task_and_events_atomically() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("a".to_string(), None);
        store.save(task.clone()).await.unwrap();
        store
            .save_event(TaskEvent {
                task_id: task.id.clone(),
                timestamp: chrono::Utc::now(),
                kind: TaskEventKind::Created,
                old_status: None,
                new_status: Some(TaskStatus::Pending),
                data: None,
            })
            .await
            .unwrap();

        store.delete(&task.id).await.unwrap();
        assert!(store.load(&task.id).await.unwrap().is_none());
        assert!(store.get_events(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reads_are_deep_copies() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("a".to_string(), None);
        store.save(task.clone()).await.unwrap();

        let mut loaded = store.load(&task.id).await.unwrap().unwrap();
        loaded.description = "mutated".to_string();

        let reloaded = store.load(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.description, "a");
    }
}
