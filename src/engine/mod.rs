use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SpiralError};
use crate::ids::{Clock, SystemClock};
use crate::models::{Task, TaskEvent, TaskEventKind, TaskStatus};
use crate::store::TaskStore;

type Callback = Box<dyn Fn(TaskEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: HashMap<u64, Callback>,
}

/// Handle returned by `subscribe`; dropping it does not unsubscribe — call
/// `unsubscribe` explicitly, mirroring the engine's synchronous contract.
pub struct SubscriptionId(u64);

/// Lazily-buffered channel backing `streamUpdates`. Yields a snapshot event
/// first, then every subsequent event until a terminal state, then closes.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<TaskEvent>,
}

impl UpdateStream {
    pub async fn next(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }
}

/// The task lifecycle state machine: validated transitions, side effects,
/// event journaling, and subscriber fan-out.
///
/// Callbacks registered via `subscribe` are invoked synchronously on the
/// thread making the engine call that produced the update; they must not
/// block. Stream consumers registered via `stream_updates` are decoupled —
/// each gets its own unbounded channel so a slow consumer cannot block
/// notification of others.
pub struct TaskEngine {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    subscribers: Mutex<HashMap<String, Subscribers>>,
    streams: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<TaskEvent>>>>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            subscribers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a new task, journals `created`, and returns it.
    pub async fn create_task(&self, description: String, role: Option<String>) -> Result<Task> {
        let mut task = Task::new(description, role);
        task.created_at = self.clock.now();
        self.store.save(task.clone()).await?;

        let event = TaskEvent {
            task_id: task.id.clone(),
            timestamp: task.created_at,
            kind: TaskEventKind::Created,
            old_status: None,
            new_status: Some(task.status),
            data: None,
        };
        self.store.save_event(event.clone()).await?;
        self.notify(event).await;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        self.store.load(id).await
    }

    /// Transitions a task to `target`. Fails with `InvalidTransition` and
    /// leaves the task unchanged if the transition is not in the table.
    pub async fn update_status(&self, id: &str, target: TaskStatus) -> Result<Task> {
        let mut task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        if !task.status.can_transition_to(target) {
            return Err(SpiralError::InvalidTransition {
                task_id: id.to_string(),
                from: format!("{:?}", task.status),
                to: format!("{:?}", target),
            });
        }

        let old_status = task.status;
        let now = self.clock.now();

        if matches!(target, TaskStatus::Planning | TaskStatus::Running) && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if target.is_terminal() {
            task.completed_at = Some(now);
        }
        task.status = target;

        self.store.save(task.clone()).await?;

        let event = TaskEvent {
            task_id: task.id.clone(),
            timestamp: now,
            kind: TaskEventKind::StatusChanged,
            old_status: Some(old_status),
            new_status: Some(target),
            data: None,
        };
        self.store.save_event(event.clone()).await?;
        self.notify(event).await;
        Ok(task)
    }

    /// Transitions to `failed` and sets `error` atomically.
    pub async fn set_error(&self, id: &str, message: String) -> Result<Task> {
        let mut task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        if !task.status.can_transition_to(TaskStatus::Failed) {
            return Err(SpiralError::InvalidTransition {
                task_id: id.to_string(),
                from: format!("{:?}", task.status),
                to: "Failed".to_string(),
            });
        }

        let old_status = task.status;
        let now = self.clock.now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.error = Some(message.clone());
        self.store.save(task.clone()).await?;

        let event = TaskEvent {
            task_id: task.id.clone(),
            timestamp: now,
            kind: TaskEventKind::ErrorSet,
            old_status: Some(old_status),
            new_status: Some(TaskStatus::Failed),
            data: Some(serde_json::json!({ "error": message })),
        };
        self.store.save_event(event.clone()).await?;
        self.notify(event).await;
        Ok(task)
    }

    /// Clamps `p` to [0,100]. Rejected on terminal tasks with `TerminalImmutable`.
    pub async fn update_progress(&self, id: &str, progress: i32) -> Result<Task> {
        let mut task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Err(SpiralError::TerminalImmutable(id.to_string()));
        }

        let clamped = progress.clamp(0, 100) as u8;
        if clamped == task.progress {
            return Ok(task);
        }

        task.progress = clamped;
        self.store.save(task.clone()).await?;

        let event = TaskEvent {
            task_id: task.id.clone(),
            timestamp: self.clock.now(),
            kind: TaskEventKind::ProgressUpdated,
            old_status: None,
            new_status: None,
            data: Some(serde_json::json!({ "progress": clamped })),
        };
        self.store.save_event(event.clone()).await?;
        self.notify(event).await;
        Ok(task)
    }

    /// Sets the task's session handle (the local transport's child session
    /// key, or a remote session id). Not one of the journaled event kinds in
    /// §4.3 — this updates the stored record only, with no event appended.
    pub async fn set_session(&self, id: &str, session_id: String) -> Result<Task> {
        let mut task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Err(SpiralError::TerminalImmutable(id.to_string()));
        }

        task.session_id = Some(session_id);
        self.store.save(task.clone()).await?;
        Ok(task)
    }

    /// Overwrites output. Legal in any non-terminal state.
    pub async fn set_output(&self, id: &str, output: String) -> Result<Task> {
        let mut task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Err(SpiralError::TerminalImmutable(id.to_string()));
        }

        task.output = Some(output.clone());
        self.store.save(task.clone()).await?;

        let event = TaskEvent {
            task_id: task.id.clone(),
            timestamp: self.clock.now(),
            kind: TaskEventKind::OutputAdded,
            old_status: None,
            new_status: None,
            data: Some(serde_json::json!({ "output": output })),
        };
        self.store.save_event(event.clone()).await?;
        self.notify(event).await;
        Ok(task)
    }

    /// Transitions a non-terminal task to `cancelled`. Returns `false` and
    /// journals nothing if the task is already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        if task.status.is_terminal() {
            return Ok(false);
        }
        self.update_status(id, TaskStatus::Cancelled).await?;
        Ok(true)
    }

    /// Delivers every subsequent update event to `callback` until unsubscribed.
    pub async fn subscribe(&self, id: &str, callback: Callback) -> SubscriptionId {
        let mut subs = self.subscribers.lock().await;
        let entry = subs.entry(id.to_string()).or_default();
        entry.next_id += 1;
        let sub_id = entry.next_id;
        entry.callbacks.insert(sub_id, callback);
        SubscriptionId(sub_id)
    }

    pub async fn unsubscribe(&self, id: &str, subscription: SubscriptionId) {
        let mut subs = self.subscribers.lock().await;
        if let Some(entry) = subs.get_mut(id) {
            entry.callbacks.remove(&subscription.0);
        }
    }

    /// Yields an initial snapshot event of the current state, then every
    /// subsequent event until a terminal state is observed, then stops.
    pub async fn stream_updates(&self, id: &str) -> Result<UpdateStream> {
        let task = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| SpiralError::NotFound(id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = TaskEvent {
            task_id: task.id.clone(),
            timestamp: self.clock.now(),
            kind: TaskEventKind::StatusChanged,
            old_status: None,
            new_status: Some(task.status),
            data: None,
        };
        let _ = tx.send(snapshot);

        if !task.status.is_terminal() {
            let mut streams = self.streams.lock().await;
            streams.entry(id.to_string()).or_default().push(tx);
        }

        Ok(UpdateStream { rx })
    }

    pub async fn get_events(&self, id: &str) -> Result<Vec<TaskEvent>> {
        self.store.get_events(id).await
    }

    async fn notify(&self, event: TaskEvent) {
        {
            let subs = self.subscribers.lock().await;
            if let Some(entry) = subs.get(&event.task_id) {
                for callback in entry.callbacks.values() {
                    callback(event.clone());
                }
            }
        }
        {
            let mut streams = self.streams.lock().await;
            if let Some(senders) = streams.get_mut(&event.task_id) {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
            }
            if event.new_status.map(|s| s.is_terminal()).unwrap_or(false) {
                streams.remove(&event.task_id);
            }
        }
        debug!(task_id = %event.task_id, kind = ?event.kind, "engine notified subscribers");
    }
}
