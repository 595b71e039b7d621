//! Task store backed by a single JSON file.
//!
//! Every change reads the file, applies the change and writes it back
//! through a uniquely named temporary file and a rename. Changes hold an
//! exclusive lock on `<file>.lock` for the whole read-modify-write, so the
//! daemon and CLI invocations can share one file. A missing file is an
//! empty store.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use nudge_scheduler::{
    NewTask, OwnerId, ReminderState, StateUpdate, StoreError, Task, TaskId, TaskStore,
};

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    next_id: TaskId,
    #[serde(default)]
    tasks: Vec<Task>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            next_id: 1,
            tasks: Vec::new(),
        }
    }
}

impl StoreFile {
    fn find_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

/// JSON file task store.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Default location, `<data dir>/nudge/tasks.json`.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nudge")
            .join("tasks.json")
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Take the cross-process lock. Released when the returned file drops.
    async fn lock_file(&self) -> Result<File, StoreError> {
        let path = self.lock_path();
        blocking(move || {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
    }

    async fn load(&self) -> Result<StoreFile, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, data: &StoreFile) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(data)?;
        let path = self.path.clone();
        blocking(move || {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut temp = NamedTempFile::new_in(dir)?;
            temp.write_all(content.as_bytes())?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await?;

        debug!(path = %self.path.display(), tasks = data.tasks.len(), "task file written");
        Ok(())
    }

    /// Load, apply `f`, and write back if `f` reports a change.
    async fn modify<T>(
        &self,
        f: impl FnOnce(&mut StoreFile) -> (T, bool),
    ) -> Result<T, StoreError> {
        let _guard = self.lock.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut data = self.load().await?;
        let (result, changed) = f(&mut data);
        if changed {
            self.save(&data).await?;
        }
        Ok(result)
    }

    async fn read(&self) -> Result<StoreFile, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }
}

/// Run blocking file work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
        .map_err(StoreError::from)
}

#[async_trait]
impl TaskStore for JsonFileStore {
    async fn list_incomplete(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .read()
            .await?
            .tasks
            .into_iter()
            .filter(|t| !t.is_completed)
            .collect())
    }

    async fn update_reminder_state(
        &self,
        id: TaskId,
        expected: &ReminderState,
        new: ReminderState,
    ) -> Result<StateUpdate, StoreError> {
        self.modify(|data| match data.find_mut(id) {
            Some(task) if !task.is_completed && task.reminder_state == *expected => {
                task.reminder_state = new;
                (StateUpdate::Updated, true)
            }
            _ => (StateUpdate::Conflict, false),
        })
        .await
    }

    async fn create(&self, task: NewTask) -> Result<Task, StoreError> {
        self.modify(|data| {
            let id = data.next_id;
            data.next_id += 1;
            let task = task.into_task(id, Utc::now());
            data.tasks.push(task.clone());
            (task, true)
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.read().await?.tasks.into_iter().find(|t| t.id == id))
    }

    async fn list_for_owner(&self, owner_id: OwnerId) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .read()
            .await?
            .tasks
            .into_iter()
            .filter(|t| t.owner_id == owner_id && !t.is_completed)
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn mark_completed(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.modify(|data| match data.find_mut(id) {
            Some(task) => {
                task.is_completed = true;
                (Some(task.clone()), true)
            }
            None => (None, false),
        })
        .await
    }

    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.modify(|data| {
            match data.tasks.iter().position(|t| t.id == id) {
                Some(index) => (Some(data.tasks.remove(index)), true),
                None => (None, false),
            }
        })
        .await
    }
}
