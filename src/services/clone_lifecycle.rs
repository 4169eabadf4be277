//! Isolated git clone lifecycle: create, auto-commit, push back, PR
//! creation (spec §4.9).
//!
//! A "clone" here is `git clone --reference <project> --dissociate` with its
//! `origin` remote removed — not a `git worktree`. Each clone is tracked by a
//! `Worktree` record persisted at `.takt/clone-meta/<encoded-branch>.json`,
//! keyed by branch name so the pipeline orchestrator can look a clone back
//! up later (e.g. on task deletion/merge cleanup).
//!
//! Git/gh failures are classified at the call site per spec §7: clone
//! creation, first push, and the initial checkout are hard failures (bubble
//! up as `EngineError::Clone` and abort the pipeline); `origin` removal,
//! the final `git push origin`, and `gh pr create` are soft — logged via
//! `tracing::warn!` and execution continues.

use std::path::Path;
use std::process::Output;

use tokio::process::Command;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::worktree::Worktree;

/// Options for creating a new isolated clone (spec §4.9 `createSharedClone`).
pub struct CloneOptions {
    pub task_slug: String,
    pub branch: Option<String>,
}

pub struct CloneLifecycle;

impl CloneLifecycle {
    /// `git clone --reference <project> --dissociate`, detach origin,
    /// checkout-or-create the task branch, and copy `user.name`/`user.email`
    /// from the source repo (spec §4.9 step 2).
    pub async fn create_shared_clone(project_dir: &Path, opts: CloneOptions) -> EngineResult<Worktree> {
        let path = Worktree::path_for_slug(project_dir, &opts.task_slug);
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| Worktree::branch_name_for_slug(&opts.task_slug));
        let base_ref = current_branch(project_dir).await.unwrap_or_else(|_| "HEAD".to_string());

        let mut worktree = Worktree::new(opts.task_slug.clone(), path.clone(), branch.clone(), base_ref);

        let project_str = project_dir.to_string_lossy().into_owned();
        run_git(&["clone", "--reference", &project_str, "--dissociate", &project_str, &path], None)
            .await
            .map_err(|e| EngineError::Clone(format!("clone creation failed: {e}")))?;

        let clone_path = Path::new(&path);

        if let Err(e) = run_git(&["remote", "remove", "origin"], Some(clone_path)).await {
            tracing::warn!(error = %e, "failed to remove origin remote (soft failure)");
        }

        if run_git(&["checkout", &branch], Some(clone_path)).await.is_err() {
            run_git(&["checkout", "-b", &branch], Some(clone_path))
                .await
                .map_err(|e| EngineError::Clone(format!("failed to create branch {branch}: {e}")))?;
        }

        if let Ok(name) = run_git_capture(&["config", "user.name"], Some(project_dir)).await {
            let _ = run_git(&["config", "user.name", name.trim()], Some(clone_path)).await;
        }
        if let Ok(email) = run_git_capture(&["config", "user.email"], Some(project_dir)).await {
            let _ = run_git(&["config", "user.email", email.trim()], Some(clone_path)).await;
        }

        worktree.activate();
        write_clone_meta(project_dir, &worktree).await?;
        Ok(worktree)
    }

    /// `git add -A`; commit only if there are changes; push the clone's
    /// `HEAD` into the project, then push the project's branch to `origin`
    /// (spec §4.9 step 4). Returns `None` if there was nothing to commit.
    /// The final `git push origin` is a soft failure per spec §7.
    pub async fn auto_commit_and_push(
        worktree: &Worktree,
        project_dir: &Path,
        commit_message: &str,
    ) -> EngineResult<Option<String>> {
        let clone_path = Path::new(&worktree.path);

        run_git(&["add", "-A"], Some(clone_path))
            .await
            .map_err(|e| EngineError::Clone(format!("git add failed: {e}")))?;

        let status = run_git_capture(&["status", "--porcelain"], Some(clone_path))
            .await
            .map_err(|e| EngineError::Clone(format!("git status failed: {e}")))?;
        if status.trim().is_empty() {
            return Ok(None);
        }

        run_git(&["commit", "-m", commit_message], Some(clone_path))
            .await
            .map_err(|e| EngineError::Clone(format!("git commit failed: {e}")))?;

        let hash = run_git_capture(&["rev-parse", "HEAD"], Some(clone_path))
            .await
            .map_err(|e| EngineError::Clone(format!("git rev-parse failed: {e}")))?
            .trim()
            .to_string();

        let project_str = project_dir.to_string_lossy().into_owned();
        run_git(&["push", &project_str, "HEAD"], Some(clone_path))
            .await
            .map_err(|e| EngineError::Clone(format!("push into project failed: {e}")))?;

        if let Err(e) = run_git(&["push", "origin", &worktree.branch], Some(project_dir)).await {
            tracing::warn!(branch = %worktree.branch, error = %e, "push to origin failed (soft failure)");
        }

        Ok(Some(hash))
    }

    /// `gh pr create --title --body --head --base` (spec §4.9 step 5). A
    /// missing `gh`, lack of PR permission, or any other `gh` failure is
    /// soft: logged, returns `Ok(None)`.
    pub async fn create_pr(worktree: &Worktree, title: &str, body: &str, base: &str, cwd: &Path) -> EngineResult<Option<String>> {
        let output = Command::new("gh")
            .args(["pr", "create", "--title", title, "--body", body, "--head", &worktree.branch, "--base", base])
            .current_dir(cwd)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string())),
            Ok(out) => {
                tracing::warn!(stderr = %String::from_utf8_lossy(&out.stderr), "gh pr create failed (soft failure)");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "gh not available (soft failure)");
                Ok(None)
            }
        }
    }

    /// Look up a clone by branch name (spec §4.9 cleanup: "the engine
    /// resolves the clone metadata...").
    pub async fn find_by_branch(project_dir: &Path, branch: &str) -> EngineResult<Option<Worktree>> {
        read_clone_meta(project_dir, branch).await
    }

    /// Remove the clone directory and its metadata file. Left in place on
    /// pipeline abort (spec §4.9 cleanup) — callers only invoke this on
    /// explicit task delete/merge.
    pub async fn remove(worktree: &mut Worktree, project_dir: &Path) -> EngineResult<()> {
        let _ = tokio::fs::remove_dir_all(&worktree.path).await;
        worktree.remove();
        remove_clone_meta(project_dir, &worktree.branch).await
    }
}

async fn current_branch(project_dir: &Path) -> EngineResult<String> {
    let raw = run_git_capture(&["rev-parse", "--abbrev-ref", "HEAD"], Some(project_dir)).await?;
    Ok(raw.trim().to_string())
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> EngineResult<Output> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| EngineError::Clone(format!("failed to spawn git {args:?}: {e}")))?;
    if !output.status.success() {
        return Err(EngineError::Clone(format!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output)
}

async fn run_git_capture(args: &[&str], cwd: Option<&Path>) -> EngineResult<String> {
    let output = run_git(args, cwd).await?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn clone_meta_path(project_dir: &Path, branch: &str) -> std::path::PathBuf {
    project_dir
        .join(".takt")
        .join("clone-meta")
        .join(format!("{}.json", Worktree::encode_branch(branch)))
}

async fn write_clone_meta(project_dir: &Path, worktree: &Worktree) -> EngineResult<()> {
    let path = clone_meta_path(project_dir, &worktree.branch);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let serialized = serde_json::to_vec_pretty(worktree).map_err(EngineError::Serialization)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &serialized).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn read_clone_meta(project_dir: &Path, branch: &str) -> EngineResult<Option<Worktree>> {
    let path = clone_meta_path(project_dir, branch);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(None);
    }
    let raw = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&raw).map_err(EngineError::Serialization)?))
}

async fn remove_clone_meta(project_dir: &Path, branch: &str) -> EngineResult<()> {
    let path = clone_meta_path(project_dir, branch);
    let _ = tokio::fs::remove_file(&path).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::process::Command;

    async fn init_project(dir: &Path) {
        run_git(&["init", "-b", "main"], Some(dir)).await.unwrap();
        run_git(&["config", "user.name", "Test User"], Some(dir)).await.unwrap();
        run_git(&["config", "user.email", "test@example.com"], Some(dir)).await.unwrap();
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        run_git(&["add", "-A"], Some(dir)).await.unwrap();
        run_git(&["commit", "-m", "initial commit"], Some(dir)).await.unwrap();
    }

    async fn git_available() -> bool {
        Command::new("git").arg("--version").output().await.is_ok()
    }

    #[tokio::test]
    async fn create_shared_clone_detaches_origin_and_checks_out_branch() {
        if !git_available().await {
            return;
        }
        let project = tempdir().unwrap();
        init_project(project.path()).await;

        let worktree = CloneLifecycle::create_shared_clone(
            project.path(),
            CloneOptions {
                task_slug: "fix-bug".to_string(),
                branch: Some("takt/1-fix-bug".to_string()),
            },
        )
        .await
        .unwrap();

        assert_eq!(worktree.branch, "takt/1-fix-bug");
        let remotes = run_git_capture(&["remote"], Some(Path::new(&worktree.path))).await.unwrap();
        assert!(remotes.trim().is_empty());

        let meta = CloneLifecycle::find_by_branch(project.path(), &worktree.branch)
            .await
            .unwrap();
        assert!(meta.is_some());

        let _ = tokio::fs::remove_dir_all(&worktree.path).await;
    }

    #[tokio::test]
    async fn auto_commit_and_push_round_trips_into_project() {
        if !git_available().await {
            return;
        }
        let project = tempdir().unwrap();
        init_project(project.path()).await;

        let worktree = CloneLifecycle::create_shared_clone(
            project.path(),
            CloneOptions {
                task_slug: "fix-bug".to_string(),
                branch: Some("takt/2-fix-bug".to_string()),
            },
        )
        .await
        .unwrap();

        tokio::fs::write(Path::new(&worktree.path).join("CHANGED.md"), "change\n")
            .await
            .unwrap();

        let hash = CloneLifecycle::auto_commit_and_push(&worktree, project.path(), "takt: fix the bug")
            .await
            .unwrap();
        assert!(hash.is_some());

        let log = run_git_capture(&["log", "--oneline", "-1", &worktree.branch], Some(project.path()))
            .await
            .unwrap();
        assert!(log.contains("takt: fix the bug"));

        let _ = tokio::fs::remove_dir_all(&worktree.path).await;
    }

    #[tokio::test]
    async fn auto_commit_with_no_changes_returns_none() {
        if !git_available().await {
            return;
        }
        let project = tempdir().unwrap();
        init_project(project.path()).await;

        let worktree = CloneLifecycle::create_shared_clone(
            project.path(),
            CloneOptions {
                task_slug: "noop".to_string(),
                branch: Some("takt/3-noop".to_string()),
            },
        )
        .await
        .unwrap();

        let hash = CloneLifecycle::auto_commit_and_push(&worktree, project.path(), "takt: noop")
            .await
            .unwrap();
        assert!(hash.is_none());

        let _ = tokio::fs::remove_dir_all(&worktree.path).await;
    }
}
