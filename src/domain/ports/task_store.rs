//! Task store port — interface over `.takt/tasks.yaml` (spec §4.8).

use async_trait::async_trait;

use crate::domain::errors::EngineResult;
use crate::domain::models::task::{FailureInfo, TaskRecord};

/// Lifecycle operations over the persisted task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Append a new `pending` task. Errors if a task with the same name exists.
    async fn add_task(&self, task: TaskRecord) -> EngineResult<()>;

    /// Atomically claim up to `limit` pending tasks for `pid`, transitioning
    /// each to `running` and returning the claimed records.
    async fn claim_next_tasks(&self, limit: usize, pid: u32) -> EngineResult<Vec<TaskRecord>>;

    /// Mark a task `completed`.
    async fn complete_task(&self, name: &str) -> EngineResult<()>;

    /// Mark a task `failed` with the given failure detail.
    async fn fail_task(&self, name: &str, failure: FailureInfo) -> EngineResult<()>;

    /// Requeue a `failed` task back to `pending`, optionally resuming from
    /// `start_movement` with `retry_note` appended to its instruction.
    async fn requeue_failed_task(
        &self,
        name: &str,
        start_movement: Option<String>,
        retry_note: Option<String>,
    ) -> EngineResult<()>;

    /// Scan `running` tasks whose `owner_pid` is no longer alive and requeue
    /// them to `pending` (spec §4.8 crash recovery, `kill(pid, 0)`).
    async fn recover_interrupted_running_tasks(&self) -> EngineResult<Vec<String>>;

    /// Fetch one task by name.
    async fn get_task(&self, name: &str) -> EngineResult<Option<TaskRecord>>;

    /// List all tasks, in file order.
    async fn list_tasks(&self) -> EngineResult<Vec<TaskRecord>>;
}
