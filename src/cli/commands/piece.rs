//! `takt piece run|list` — direct piece execution and piece discovery,
//! bypassing the task queue (spec §6, Component B).

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::application::piece_engine::{NoopCallbacks, PieceEngine, PieceEngineOptions};
use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};
use crate::services::event_bus::{RunDirectory, SessionLog};

#[derive(Serialize)]
pub struct PieceRunOutput {
    pub piece: String,
    pub completed: bool,
    pub final_movement: String,
    pub abort_reason: Option<String>,
}

impl CommandOutput for PieceRunOutput {
    fn to_human(&self) -> String {
        if self.completed {
            format!("Piece '{}' completed at movement '{}'", self.piece, self.final_movement)
        } else {
            format!(
                "Piece '{}' aborted at movement '{}': {}",
                self.piece,
                self.final_movement,
                self.abort_reason.as_deref().unwrap_or("unknown reason")
            )
        }
    }
}

pub async fn run(
    ctx: &AppContext,
    name: String,
    task: String,
    start_movement: Option<String>,
    json_mode: bool,
) -> Result<i32> {
    let piece = ctx.piece_loader.load(&name)?;

    let slug = format!("{}-{}", name, Utc::now().timestamp());
    let run_dir = RunDirectory::create(&ctx.project_dir, &slug).await?;
    let session_log = SessionLog::open(&run_dir.log_path()).await?;
    run_dir.write_meta(&run_dir.initial_meta(&task, &piece.name)).await?;

    let engine = PieceEngine::new(
        &piece,
        &session_log,
        ctx.project_dir.clone(),
        run_dir.report_dir.clone(),
        run_dir.context_dir.clone(),
    );

    let options = PieceEngineOptions {
        provider: Some(ctx.config.default_provider),
        model: ctx.config.default_model.clone(),
        start_movement,
        ..Default::default()
    };

    let outcome = engine
        .run(&task, ctx.provider_factory.as_ref(), &NoopCallbacks, options)
        .await?;

    let exit_code = if outcome.is_completed() { 0 } else { 3 };
    output(
        &PieceRunOutput {
            piece: piece.name.clone(),
            completed: outcome.is_completed(),
            final_movement: outcome.state.current_movement.clone(),
            abort_reason: outcome.abort_reason.clone(),
        },
        json_mode,
    );
    Ok(exit_code)
}

#[derive(Serialize)]
pub struct PieceListOutput {
    pub pieces: Vec<String>,
}

impl CommandOutput for PieceListOutput {
    fn to_human(&self) -> String {
        if self.pieces.is_empty() {
            return "No pieces found in .takt/pieces.".to_string();
        }
        self.pieces.join("\n")
    }
}

pub async fn list(ctx: &AppContext, json_mode: bool) -> Result<()> {
    let pieces_dir = ctx.project_dir.join(".takt").join("pieces");
    let mut names = Vec::new();

    if let Ok(mut entries) = tokio::fs::read_dir(&pieces_dir).await {
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().is_some_and(|ext| ext == "yaml" || ext == "yml") {
                    names.push(name.to_string());
                }
            }
        }
    }
    names.sort();

    output(&PieceListOutput { pieces: names }, json_mode);
    Ok(())
}
