//! Task store port and an in-memory implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{NewTask, OwnerId, ReminderState, StoreError, Task, TaskId};

/// Result of a compare-and-swap on a task's reminder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdate {
    /// The new state was written.
    Updated,
    /// The task was completed, deleted, or its state changed since it was
    /// read. Nothing was written.
    Conflict,
}

/// Durable record of tasks.
///
/// `update_reminder_state` is the engine's only write and must be atomic:
/// either the whole new state is stored or nothing is.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Snapshot of every task that is not completed.
    async fn list_incomplete(&self) -> Result<Vec<Task>, StoreError>;

    /// Replace the reminder state of `id` if it still equals `expected`
    /// and the task is still incomplete.
    async fn update_reminder_state(
        &self,
        id: TaskId,
        expected: &ReminderState,
        new: ReminderState,
    ) -> Result<StateUpdate, StoreError>;

    /// Store a new task and assign its id.
    async fn create(&self, task: NewTask) -> Result<Task, StoreError>;

    /// Look up a task.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Incomplete tasks of one owner, ordered by id.
    async fn list_for_owner(&self, owner_id: OwnerId) -> Result<Vec<Task>, StoreError>;

    /// Mark a task completed. Returns the updated task, or `None` if it does
    /// not exist.
    async fn mark_completed(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Remove a task. Returns the removed task, or `None` if it did not exist.
    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError>;
}

/// Task store kept in process memory.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
    next_id: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a fully formed task, replacing any task with the same id.
    pub async fn insert(&self, task: Task) {
        self.next_id.fetch_max(task.id + 1, Ordering::SeqCst);
        self.tasks.write().await.insert(task.id, task);
    }

    /// Every stored task, completed or not.
    pub async fn all(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_incomplete(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.is_completed)
            .cloned()
            .collect())
    }

    async fn update_reminder_state(
        &self,
        id: TaskId,
        expected: &ReminderState,
        new: ReminderState,
    ) -> Result<StateUpdate, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if !task.is_completed && task.reminder_state == *expected => {
                task.reminder_state = new;
                Ok(StateUpdate::Updated)
            }
            _ => {
                debug!(task_id = id, "reminder state compare-and-swap lost");
                Ok(StateUpdate::Conflict)
            }
        }
    }

    async fn create(&self, task: NewTask) -> Result<Task, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = task.into_task(id, Utc::now());
        self.tasks.write().await.insert(id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_for_owner(&self, owner_id: OwnerId) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.owner_id == owner_id && !t.is_completed)
            .cloned()
            .collect())
    }

    async fn mark_completed(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let mut tasks = self.tasks.write().await;
        Ok(tasks.get_mut(&id).map(|task| {
            task.is_completed = true;
            task.clone()
        }))
    }

    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.write().await.remove(&id))
    }
}
