//! `takt run` — drain the task queue with the worker pool (spec §4.8, §6).

use anyhow::Result;
use std::sync::Arc;

use crate::cli::context::AppContext;
use crate::services::pipeline_orchestrator::{PipelineConfig, PipelineOrchestrator};
use crate::services::worker_pool::WorkerPool;

/// Returns the process exit code (spec §6: `0` success, `3` on a failed
/// drain — any task ending `failed` after the queue empties).
pub async fn execute(ctx: &AppContext, default_piece: Option<String>) -> Result<i32> {
    let orchestrator = Arc::new(PipelineOrchestrator::new(PipelineConfig {
        project_dir: ctx.project_dir.clone(),
        piece_loader: ctx.piece_loader.clone(),
        provider_factory: ctx.provider_factory.clone(),
        default_piece: default_piece.unwrap_or_else(|| "default".to_string()),
        default_provider: Some(ctx.config.default_provider),
        default_model: ctx.config.default_model.clone(),
    }));

    let pool = WorkerPool::new(ctx.config.worker_pool);
    pool.run(ctx.task_store.clone(), orchestrator).await?;

    let tasks = ctx.task_store.list_tasks().await?;
    let any_failed = tasks
        .iter()
        .any(|t| t.status == crate::domain::models::task::TaskStatus::Failed);
    Ok(if any_failed { 3 } else { 0 })
}
