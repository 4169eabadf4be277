//! `.takt/tasks.yaml` CRUD, lifecycle transitions, and crash recovery
//! (spec §4.8).
//!
//! The whole file is the unit of mutation: every operation takes the
//! in-process mutex, reads the current file, validates every record against
//! §3's invariants, mutates, and writes back atomically (temp file + fsync +
//! rename). There is no cross-process locking (spec §5, §9 open question);
//! concurrent `takt` processes against the same project are out of scope.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::task::{FailureInfo, TaskRecord, TaskStatus};
use crate::domain::ports::task_store::TaskStore;

/// The YAML document shape: `{ tasks: TaskRecord[] }` (spec §6).
#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskRecord>,
}

/// File-backed `TaskStore` over `.takt/tasks.yaml`.
pub struct YamlTaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl YamlTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Layout rooted at `<project_dir>/.takt/tasks.yaml` (spec §6).
    pub fn for_project(project_dir: impl AsRef<Path>) -> Self {
        Self::new(project_dir.as_ref().join(".takt").join("tasks.yaml"))
    }

    async fn read(&self) -> EngineResult<Vec<TaskRecord>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let file: TaskFile = serde_yaml::from_str(&raw)
            .map_err(|e| EngineError::TaskQueueSchema(format!("malformed tasks.yaml: {e}")))?;
        for task in &file.tasks {
            task.validate()
                .map_err(|e| EngineError::TaskQueueSchema(e.to_string()))?;
        }
        Ok(file.tasks)
    }

    /// Atomic write: temp file in the same directory, fsync, rename
    /// (spec §4.8, §9).
    async fn write(&self, tasks: &[TaskRecord]) -> EngineResult<()> {
        for task in tasks {
            task.validate()
                .map_err(|e| EngineError::TaskQueueSchema(e.to_string()))?;
        }
        let file = TaskFile {
            tasks: tasks.to_vec(),
        };
        let serialized = serde_yaml::to_string(&file)
            .map_err(|e| EngineError::TaskQueueSchema(format!("failed to serialize tasks.yaml: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("yaml.tmp");
        let mut tmp_file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        tmp_file.write_all(serialized.as_bytes()).await?;
        tmp_file.sync_all().await?;
        drop(tmp_file);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    fn find_mut<'a>(tasks: &'a mut [TaskRecord], name: &str) -> Option<&'a mut TaskRecord> {
        tasks.iter_mut().find(|t| t.name == name)
    }

    /// Allocate a unique task name: a sanitized first-line slug, with a
    /// `-N` suffix appended until it doesn't collide with an existing task.
    pub fn slugify(content_first_line: &str, existing: &[TaskRecord]) -> String {
        let base = content_first_line
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect::<String>();
        let collapsed = base
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        let base_slug = if collapsed.is_empty() {
            "task".to_string()
        } else {
            collapsed.chars().take(48).collect::<String>()
        };

        if !existing.iter().any(|t| t.name == base_slug) {
            return base_slug;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base_slug}-{n}");
            if !existing.iter().any(|t| t.name == candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[async_trait]
impl TaskStore for YamlTaskStore {
    async fn add_task(&self, task: TaskRecord) -> EngineResult<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        if tasks.iter().any(|t| t.name == task.name) {
            return Err(EngineError::TaskQueueSchema(format!(
                "task already exists: {}",
                task.name
            )));
        }
        task.validate()
            .map_err(|e| EngineError::TaskQueueSchema(e.to_string()))?;
        tasks.push(task);
        self.write(&tasks).await
    }

    async fn claim_next_tasks(&self, limit: usize, pid: u32) -> EngineResult<Vec<TaskRecord>> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;

        let pending_names: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .map(|t| t.name.clone())
            .collect();

        let mut claimed = Vec::with_capacity(pending_names.len());
        for name in &pending_names {
            if let Some(task) = Self::find_mut(&mut tasks, name) {
                task.mark_running(pid);
                claimed.push(task.clone());
            }
        }

        self.write(&tasks).await?;
        Ok(claimed)
    }

    async fn complete_task(&self, name: &str) -> EngineResult<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        let task = tasks
            .iter_mut()
            .find(|t| t.name == name && matches!(t.status, TaskStatus::Running | TaskStatus::Pending))
            .ok_or_else(|| EngineError::TaskNotFound(name.to_string()))?;
        task.mark_completed();
        self.write(&tasks).await
    }

    async fn fail_task(&self, name: &str, failure: FailureInfo) -> EngineResult<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        let task = tasks
            .iter_mut()
            .find(|t| t.name == name && matches!(t.status, TaskStatus::Running | TaskStatus::Pending))
            .ok_or_else(|| EngineError::TaskNotFound(name.to_string()))?;
        task.mark_failed(failure);
        self.write(&tasks).await
    }

    async fn requeue_failed_task(
        &self,
        name: &str,
        start_movement: Option<String>,
        retry_note: Option<String>,
    ) -> EngineResult<()> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        let task = tasks
            .iter_mut()
            .find(|t| t.name == name && t.status == TaskStatus::Failed)
            .ok_or_else(|| EngineError::TaskNotFound(name.to_string()))?;
        task.requeue(start_movement, retry_note);
        self.write(&tasks).await
    }

    async fn recover_interrupted_running_tasks(&self) -> EngineResult<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.read().await?;
        let mut recovered = Vec::new();

        for task in &mut tasks {
            if task.status != TaskStatus::Running {
                continue;
            }
            #[cfg(unix)]
            let dead = task.owner_is_dead();
            #[cfg(not(unix))]
            let dead = task.owner_pid.is_none();

            if dead {
                task.requeue(None, None);
                recovered.push(task.name.clone());
            }
        }

        if !recovered.is_empty() {
            self.write(&tasks).await?;
        }
        Ok(recovered)
    }

    async fn get_task(&self, name: &str) -> EngineResult<Option<TaskRecord>> {
        let _guard = self.lock.lock().await;
        let tasks = self.read().await?;
        Ok(tasks.into_iter().find(|t| t.name == name))
    }

    async fn list_tasks(&self) -> EngineResult<Vec<TaskRecord>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }
}
