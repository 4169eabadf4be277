//! Git clone lifecycle model (spec §4.9, §6).
//!
//! A `Worktree` here is not a `git worktree` but an isolated clone produced by
//! `git clone --reference <project> --dissociate` with its origin removed.
//! One record is persisted per clone at `.takt/clone-meta/<encoded-branch>.json`,
//! keyed by branch name so the pipeline orchestrator can look a clone back up
//! by the branch a task is running on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a clone through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Active,
    Completed,
    Merging,
    Merged,
    Failed,
    Removed,
}

impl Default for WorktreeStatus {
    fn default() -> Self {
        Self::Creating
    }
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "creating" => Some(Self::Creating),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "merging" => Some(Self::Merging),
            "merged" => Some(Self::Merged),
            "failed" => Some(Self::Failed),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Removed)
    }
}

/// Metadata for one isolated clone (spec §4.9).
///
/// Persisted as `.takt/clone-meta/<encoded-branch>.json`; `branch` is the
/// lookup key, `path` the filesystem location of the clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: Uuid,
    pub task_name: String,
    pub path: String,
    pub branch: String,
    pub base_ref: String,
    pub status: WorktreeStatus,
    pub merge_commit: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Worktree {
    pub fn new(
        task_name: impl Into<String>,
        path: impl Into<String>,
        branch: impl Into<String>,
        base_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_name: task_name.into(),
            path: path.into(),
            branch: branch.into(),
            base_ref: base_ref.into(),
            status: WorktreeStatus::Creating,
            merge_commit: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Branch name for a new clone: `takt/<unix-timestamp>-<slug>` (spec §4.9).
    pub fn branch_name_for_slug(slug: &str) -> String {
        format!("takt/{}-{}", Utc::now().timestamp(), slug)
    }

    /// Clone directory, a sibling of the project directory (spec §8 scenario 6:
    /// `../<timestamp>-<slug>`).
    pub fn path_for_slug(project_dir: &std::path::Path, slug: &str) -> String {
        let parent = project_dir.parent().unwrap_or(project_dir);
        parent
            .join(format!("{}-{}", Utc::now().timestamp(), slug))
            .to_string_lossy()
            .into_owned()
    }

    /// Key used for `.takt/clone-meta/<encoded-branch>.json` — branch names
    /// contain `/`, which is not a valid filename component.
    pub fn encode_branch(branch: &str) -> String {
        branch.replace('/', "__")
    }

    pub fn activate(&mut self) {
        self.status = WorktreeStatus::Active;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self) {
        self.status = WorktreeStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn start_merge(&mut self) {
        self.status = WorktreeStatus::Merging;
        self.updated_at = Utc::now();
    }

    pub fn merged(&mut self, commit: impl Into<String>) {
        self.status = WorktreeStatus::Merged;
        self.merge_commit = Some(commit.into());
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = WorktreeStatus::Failed;
        self.error_message = Some(error.into());
        self.updated_at = Utc::now();
    }

    pub fn remove(&mut self) {
        self.status = WorktreeStatus::Removed;
        self.updated_at = Utc::now();
    }

    pub fn can_cleanup(&self) -> bool {
        matches!(
            self.status,
            WorktreeStatus::Merged | WorktreeStatus::Failed | WorktreeStatus::Completed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worktree_creation() {
        let wt = Worktree::new("fix-bug", "/tmp/clones/fix-bug", "takt/1-fix-bug", "main");
        assert_eq!(wt.task_name, "fix-bug");
        assert_eq!(wt.status, WorktreeStatus::Creating);
    }

    #[test]
    fn worktree_lifecycle() {
        let mut wt = Worktree::new("fix-bug", "/path", "branch", "main");

        wt.activate();
        assert_eq!(wt.status, WorktreeStatus::Active);

        wt.complete();
        assert_eq!(wt.status, WorktreeStatus::Completed);
        assert!(wt.completed_at.is_some());

        wt.start_merge();
        assert_eq!(wt.status, WorktreeStatus::Merging);

        wt.merged("abc123");
        assert_eq!(wt.status, WorktreeStatus::Merged);
        assert_eq!(wt.merge_commit, Some("abc123".to_string()));
    }

    #[test]
    fn branch_name_has_takt_prefix_and_slug() {
        let branch = Worktree::branch_name_for_slug("fix-bug");
        assert!(branch.starts_with("takt/"));
        assert!(branch.ends_with("-fix-bug"));
    }

    #[test]
    fn encode_branch_replaces_slashes() {
        assert_eq!(Worktree::encode_branch("takt/123-fix-bug"), "takt__123-fix-bug");
    }
}
