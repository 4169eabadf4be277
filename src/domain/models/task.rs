//! Task queue record — the schema persisted in `.takt/tasks.yaml` (spec §3).
//!
//! A `TaskRecord` moves through `pending -> running -> (completed | failed)`,
//! with `failed -> pending` available via `requeue`. The state machine lives
//! here; the file itself (read-modify-write, atomic rename) is owned by
//! `services::task_queue_service`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a queued task (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Recorded failure detail, set only on a `failed` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub movement: Option<String>,
    pub error: String,
    pub last_message: Option<String>,
}

/// A violation of the §3 invariants relating `status` to the presence of
/// `started_at`/`completed_at`/`owner_pid`/`failure`.
#[derive(Debug, Error)]
pub enum TaskInvariantError {
    #[error("pending task {0} must not have started_at/owner_pid/failure set")]
    PendingHasTerminalFields(String),
    #[error("running task {0} must have started_at and owner_pid set")]
    RunningMissingOwnership(String),
    #[error("completed task {0} must have started_at and completed_at, and no failure/owner_pid")]
    CompletedFieldsInvalid(String),
    #[error("failed task {0} must have started_at, completed_at, and a failure record, and no owner_pid")]
    FailedFieldsInvalid(String),
    #[error("task {0} must set exactly one of content, content_file, task_dir")]
    ContentNotExclusive(String),
}

/// One entry in `.takt/tasks.yaml` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub status: TaskStatus,

    pub content: Option<String>,
    pub content_file: Option<String>,
    pub task_dir: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub owner_pid: Option<u32>,

    pub failure: Option<FailureInfo>,

    pub piece: Option<String>,
    pub worktree: Option<String>,
    pub branch: Option<String>,
    pub issue: Option<String>,
    pub start_movement: Option<String>,
    pub retry_note: Option<String>,
    #[serde(default)]
    pub auto_pr: bool,
}

impl TaskRecord {
    /// Build a new `pending` task with the given name and content.
    pub fn new_pending(name: impl Into<String>, content: TaskContent) -> Self {
        let mut record = Self {
            name: name.into(),
            status: TaskStatus::Pending,
            content: None,
            content_file: None,
            task_dir: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            owner_pid: None,
            failure: None,
            piece: None,
            worktree: None,
            branch: None,
            issue: None,
            start_movement: None,
            retry_note: None,
            auto_pr: false,
        };
        content.apply(&mut record);
        record
    }

    /// Check §3's status/field invariants.
    pub fn validate(&self) -> Result<(), TaskInvariantError> {
        let content_count = [
            self.content.is_some(),
            self.content_file.is_some(),
            self.task_dir.is_some(),
        ]
        .into_iter()
        .filter(|b| *b)
        .count();
        if content_count != 1 {
            return Err(TaskInvariantError::ContentNotExclusive(self.name.clone()));
        }

        match self.status {
            TaskStatus::Pending => {
                if self.started_at.is_some() || self.owner_pid.is_some() || self.failure.is_some() {
                    return Err(TaskInvariantError::PendingHasTerminalFields(self.name.clone()));
                }
            }
            TaskStatus::Running => {
                if self.started_at.is_none() || self.owner_pid.is_none() {
                    return Err(TaskInvariantError::RunningMissingOwnership(self.name.clone()));
                }
            }
            TaskStatus::Completed => {
                if self.started_at.is_none()
                    || self.completed_at.is_none()
                    || self.failure.is_some()
                    || self.owner_pid.is_some()
                {
                    return Err(TaskInvariantError::CompletedFieldsInvalid(self.name.clone()));
                }
            }
            TaskStatus::Failed => {
                if self.started_at.is_none()
                    || self.completed_at.is_none()
                    || self.failure.is_none()
                    || self.owner_pid.is_some()
                {
                    return Err(TaskInvariantError::FailedFieldsInvalid(self.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Transition `pending -> running`, claiming ownership for `pid`.
    pub fn mark_running(&mut self, pid: u32) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.owner_pid = Some(pid);
    }

    /// Transition `running -> completed`.
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.owner_pid = None;
        self.failure = None;
    }

    /// Transition `running|pending -> failed`.
    pub fn mark_failed(&mut self, failure: FailureInfo) {
        self.status = TaskStatus::Failed;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.completed_at = Some(Utc::now());
        self.owner_pid = None;
        self.failure = Some(failure);
    }

    /// Transition `failed -> pending`, clearing timestamps/failure and
    /// optionally setting a retry entry point and note (spec §4.8).
    pub fn requeue(&mut self, start_movement: Option<String>, retry_note: Option<String>) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.owner_pid = None;
        self.failure = None;
        if start_movement.is_some() {
            self.start_movement = start_movement;
        }
        if retry_note.is_some() {
            self.retry_note = retry_note;
        }
    }

    /// True if the owning process is no longer alive (spec §4.8
    /// `recoverInterruptedRunningTasks`, POSIX `kill(pid, 0)` semantics).
    #[cfg(unix)]
    pub fn owner_is_dead(&self) -> bool {
        match self.owner_pid {
            None => true,
            Some(pid) => {
                use nix::sys::signal::kill;
                use nix::unistd::Pid;
                kill(Pid::from_raw(pid as i32), None).is_err()
            }
        }
    }
}

/// Convenience constructor for the three mutually-exclusive content shapes.
pub enum TaskContent {
    Text(String),
    File(String),
    Dir(String),
}

impl TaskContent {
    fn apply(self, record: &mut TaskRecord) {
        match self {
            Self::Text(s) => record.content = Some(s),
            Self::File(s) => record.content_file = Some(s),
            Self::Dir(s) => record.task_dir = Some(s),
        }
    }
}
