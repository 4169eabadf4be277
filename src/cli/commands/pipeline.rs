//! `takt pipeline <task>` and the bare `takt <task-text|#N>` invocation —
//! one pipeline pass outside the worker pool (spec §6).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;

use crate::cli::context::AppContext;
use crate::domain::models::task::{TaskContent, TaskRecord};
use crate::services::pipeline_orchestrator::{PipelineConfig, PipelineOrchestrator};
use crate::services::worker_pool::{TaskOutcome, TaskRunner};

/// Returns the process exit code (spec §6: `0` success, `3` piece failed).
pub async fn execute(
    ctx: &AppContext,
    task_text: String,
    piece: Option<String>,
    branch: Option<String>,
    auto_pr: bool,
) -> Result<i32> {
    let orchestrator = PipelineOrchestrator::new(PipelineConfig {
        project_dir: ctx.project_dir.clone(),
        piece_loader: ctx.piece_loader.clone(),
        provider_factory: ctx.provider_factory.clone(),
        default_piece: piece.clone().unwrap_or_else(|| "default".to_string()),
        default_provider: Some(ctx.config.default_provider),
        default_model: ctx.config.default_model.clone(),
    });

    let task = build_ephemeral_task(&task_text, piece, branch, auto_pr);
    let abort = Arc::new(AtomicBool::new(false));

    match orchestrator.run_task(task, abort).await {
        TaskOutcome::Completed => Ok(0),
        TaskOutcome::Failed(failure) => {
            eprintln!(
                "pipeline failed{}: {}",
                failure
                    .movement
                    .as_deref()
                    .map(|m| format!(" in movement {m}"))
                    .unwrap_or_default(),
                failure.error
            );
            Ok(3)
        }
    }
}

fn build_ephemeral_task(
    task_text: &str,
    piece: Option<String>,
    branch: Option<String>,
    auto_pr: bool,
) -> TaskRecord {
    let name = format!("pipeline-{}", chrono::Utc::now().timestamp());
    let (content, issue) = if let Some(stripped) = task_text.strip_prefix('#') {
        (format!("GitHub issue #{stripped}"), Some(stripped.to_string()))
    } else {
        (task_text.to_string(), None)
    };

    let mut task = TaskRecord::new_pending(&name, TaskContent::Text(content));
    task.piece = piece;
    task.branch = branch;
    task.issue = issue;
    task.auto_pr = auto_pr;
    task
}
