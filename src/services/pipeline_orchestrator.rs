//! End-to-end single-task pipeline (spec §4.9): resolve task content,
//! resolve execution context (clone or direct), run the piece engine,
//! auto-commit/push/PR on success, and fold the result back into the task
//! record. Implements `TaskRunner` so the worker pool can drive it directly.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::application::piece_engine::{NoopCallbacks, PieceEngine, PieceEngineOptions};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::ProviderKind;
use crate::domain::models::task::{FailureInfo, TaskRecord};
use crate::domain::ports::provider::ProviderFactory;
use crate::infrastructure::piece_loader::PieceLoader;
use crate::services::clone_lifecycle::{CloneLifecycle, CloneOptions};
use crate::services::event_bus::{RunDirectory, SessionLog};
use crate::services::worker_pool::{TaskOutcome, TaskRunner};

/// Fixed configuration for one orchestrator instance; shared across every
/// task it runs.
pub struct PipelineConfig {
    pub project_dir: PathBuf,
    pub piece_loader: Arc<PieceLoader>,
    pub provider_factory: Arc<dyn ProviderFactory>,
    pub default_piece: String,
    pub default_provider: Option<ProviderKind>,
    pub default_model: Option<String>,
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Resolve `{task, issue?}` (spec §4.9 step 1). A task carrying `issue`
    /// fetches and formats the issue via `gh`; otherwise reads whichever of
    /// `content` / `content_file` / `task_dir` the record set.
    async fn resolve_task_content(&self, task: &TaskRecord) -> EngineResult<String> {
        if let Some(issue) = &task.issue {
            return fetch_issue_markdown(&self.config.project_dir, issue).await;
        }
        if let Some(content) = &task.content {
            return Ok(content.clone());
        }
        if let Some(path) = &task.content_file {
            let raw = tokio::fs::read_to_string(self.config.project_dir.join(path)).await?;
            return Ok(raw);
        }
        if let Some(dir) = &task.task_dir {
            return read_task_dir(&self.config.project_dir.join(dir)).await;
        }
        Err(EngineError::TaskQueueSchema(format!(
            "task {} has no content",
            task.name
        )))
    }

    /// Resolve execution context: either a fresh/reused isolated clone, or a
    /// direct run against the project directory (spec §4.9 step 2).
    async fn resolve_execution_context(&self, task: &TaskRecord) -> EngineResult<ExecutionContext> {
        let Some(branch) = &task.branch else {
            return Ok(ExecutionContext {
                cwd: self.config.project_dir.clone(),
                clone: None,
            });
        };

        if let Some(existing) = CloneLifecycle::find_by_branch(&self.config.project_dir, branch).await? {
            let cwd = PathBuf::from(&existing.path);
            return Ok(ExecutionContext {
                cwd,
                clone: Some(existing),
            });
        }

        let worktree = CloneLifecycle::create_shared_clone(
            &self.config.project_dir,
            CloneOptions {
                task_slug: task.name.clone(),
                branch: Some(branch.clone()),
            },
        )
        .await?;
        let cwd = PathBuf::from(&worktree.path);
        Ok(ExecutionContext {
            cwd,
            clone: Some(worktree),
        })
    }

    async fn run_inner(&self, task: &TaskRecord, abort_signal: Arc<AtomicBool>) -> Result<(), PipelineFailure> {
        let content = self
            .resolve_task_content(task)
            .await
            .map_err(|e| PipelineFailure::new(None, e.to_string()))?;

        let exec_ctx = self
            .resolve_execution_context(task)
            .await
            .map_err(|e| PipelineFailure::new(None, e.to_string()))?;

        let piece_name = task.piece.clone().unwrap_or_else(|| self.config.default_piece.clone());
        let piece = self
            .config
            .piece_loader
            .load(&piece_name)
            .map_err(|e| PipelineFailure::new(None, e.to_string()))?;

        let slug = format!("{}-{}", task.name, Utc::now().timestamp());
        let run_dir = RunDirectory::create(&self.config.project_dir, &slug)
            .await
            .map_err(|e| PipelineFailure::new(None, e.to_string()))?;
        let session_log = SessionLog::open(&run_dir.log_path())
            .await
            .map_err(|e| PipelineFailure::new(None, e.to_string()))?;
        let mut meta = run_dir.initial_meta(&task.name, &piece.name);
        run_dir
            .write_meta(&meta)
            .await
            .map_err(|e| PipelineFailure::new(None, e.to_string()))?;

        let engine = PieceEngine::new(&piece, &session_log, exec_ctx.cwd.clone(), run_dir.report_dir.clone(), run_dir.context_dir.clone());

        let options = PieceEngineOptions {
            provider: self.config.default_provider,
            model: self.config.default_model.clone(),
            start_movement: task.start_movement.clone(),
            retry_note: task.retry_note.clone(),
            abort_signal: Some(abort_signal),
            ..Default::default()
        };

        let outcome = engine
            .run(&content, self.config.provider_factory.as_ref(), &NoopCallbacks, options)
            .await
            .map_err(|e| PipelineFailure::new(Some(piece.initial_movement.clone()), e.to_string()))?;

        if !outcome.is_completed() {
            meta.status = "aborted".to_string();
            let _ = run_dir.write_meta(&meta).await;
            let last_message = outcome
                .state
                .movement_outputs
                .get(&outcome.state.current_movement)
                .map(|r| r.content.clone());
            return Err(PipelineFailure {
                movement: Some(outcome.state.current_movement.clone()),
                error: outcome
                    .abort_reason
                    .clone()
                    .unwrap_or_else(|| "piece aborted".to_string()),
                last_message,
            });
        }

        meta.status = "completed".to_string();
        let _ = run_dir.write_meta(&meta).await;

        if let Some(worktree) = &exec_ctx.clone {
            let commit_message = format!("takt: {}", first_line(&content));
            match CloneLifecycle::auto_commit_and_push(worktree, &self.config.project_dir, &commit_message).await {
                Ok(_) => {
                    if task.auto_pr {
                        let base = worktree.base_ref.clone();
                        let _ = CloneLifecycle::create_pr(
                            worktree,
                            &first_line(&content),
                            &content,
                            &base,
                            &self.config.project_dir,
                        )
                        .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(task = %task.name, error = %e, "auto-commit/push failed after successful piece run");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TaskRunner for PipelineOrchestrator {
    async fn run_task(&self, task: TaskRecord, abort_signal: Arc<AtomicBool>) -> TaskOutcome {
        match self.run_inner(&task, abort_signal).await {
            Ok(()) => TaskOutcome::Completed,
            Err(failure) => TaskOutcome::Failed(FailureInfo {
                movement: failure.movement,
                error: failure.error,
                last_message: failure.last_message,
            }),
        }
    }
}

struct ExecutionContext {
    cwd: PathBuf,
    clone: Option<crate::domain::models::worktree::Worktree>,
}

struct PipelineFailure {
    movement: Option<String>,
    error: String,
    last_message: Option<String>,
}

impl PipelineFailure {
    fn new(movement: Option<String>, error: String) -> Self {
        Self {
            movement,
            error,
            last_message: None,
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or(text).to_string()
}

async fn read_task_dir(dir: &Path) -> EngineResult<String> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut combined = String::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let body = tokio::fs::read_to_string(entry.path()).await.unwrap_or_default();
            combined.push_str(&format!("## {name}\n\n{body}\n\n"));
        }
    }
    Ok(combined)
}

/// `gh issue view <n> --json title,body,labels,comments` formatted into
/// markdown (spec §4.9 step 1). A missing `gh` binary is a hard failure.
async fn fetch_issue_markdown(project_dir: &Path, issue: &str) -> EngineResult<String> {
    let output: Output = Command::new("gh")
        .args(["issue", "view", issue, "--json", "title,body,labels,comments"])
        .current_dir(project_dir)
        .output()
        .await
        .map_err(|e| EngineError::Config(format!("gh not available: {e}")))?;

    if !output.status.success() {
        return Err(EngineError::Config(format!(
            "gh issue view {issue} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).map_err(EngineError::Serialization)?;

    let title = parsed.get("title").and_then(|v| v.as_str()).unwrap_or("");
    let body = parsed.get("body").and_then(|v| v.as_str()).unwrap_or("");
    let labels: Vec<String> = parsed
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(|n| n.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let comments: Vec<(String, String)> = parsed
        .get("comments")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|c| {
                    let author = c
                        .get("author")
                        .and_then(|a| a.get("login"))
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let body = c.get("body").and_then(|b| b.as_str()).unwrap_or("").to_string();
                    (author, body)
                })
                .collect()
        })
        .unwrap_or_default();

    let mut md = format!("# {title}\n\n{body}\n");
    if !labels.is_empty() {
        md.push_str(&format!("\n**Labels:** {}\n", labels.join(", ")));
    }
    if !comments.is_empty() {
        md.push_str("\n## Comments\n");
        for (author, body) in comments {
            md.push_str(&format!("\n**{author}:**\n{body}\n"));
        }
    }
    Ok(md)
}
