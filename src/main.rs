//! TAKT CLI entry point (spec §6).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use takt::cli::commands::{add, eject, ensemble, export_cc, list, piece, pipeline, run, watch};
use takt::cli::{AppContext, Cli, Commands, PieceCommands};
use takt::infrastructure::config::ConfigLoader;
use takt::infrastructure::logging::{LogConfig, LoggerImpl};
use takt::infrastructure::piece_loader::PieceLoader;
use takt::infrastructure::providers::registry::ProviderRegistry;
use takt::services::task_queue_service::YamlTaskStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().unwrap_or_default();
    let _logger = LoggerImpl::init(&LogConfig::default()).ok();

    let project_dir = std::env::current_dir()?;
    let global_pieces_dir = home_dir().join(".takt").join("pieces");
    let builtin_pieces_dir = builtin_pieces_dir();

    let task_store: Arc<dyn takt::domain::ports::task_store::TaskStore> =
        Arc::new(YamlTaskStore::for_project(&project_dir));
    let provider_factory = Arc::new(ProviderRegistry::from_config(&config)?);
    let piece_loader = Arc::new(PieceLoader::for_project(
        project_dir.clone(),
        global_pieces_dir.clone(),
        builtin_pieces_dir.clone(),
    ));

    let ctx = AppContext {
        project_dir,
        global_pieces_dir,
        builtin_pieces_dir,
        config,
        task_store,
        provider_factory,
        piece_loader,
    };

    let exit_code = dispatch(&cli, &ctx).await?;
    std::process::exit(exit_code)
}

/// Dispatches to the matching subcommand handler, or to a single pipeline
/// pass when a bare task/issue reference is given (spec §6). Returns the
/// process exit code.
async fn dispatch(cli: &Cli, ctx: &AppContext) -> Result<i32> {
    let json_mode = cli.json;

    match &cli.command {
        Some(Commands::Run { piece: default_piece }) => run::execute(ctx, default_piece.clone()).await,

        Some(Commands::Add {
            text,
            issue,
            piece,
            branch,
            auto_pr,
        }) => {
            add::execute(
                ctx,
                text.clone(),
                issue.clone(),
                piece.clone(),
                branch.clone(),
                *auto_pr,
                json_mode,
            )
            .await?;
            Ok(0)
        }

        Some(Commands::List) => {
            list::execute(ctx, json_mode).await?;
            Ok(0)
        }

        Some(Commands::Watch { interval_ms }) => {
            watch::execute(ctx, *interval_ms, json_mode).await?;
            Ok(0)
        }

        Some(Commands::Piece(PieceCommands::Run {
            name,
            task,
            start_movement,
        })) => piece::run(ctx, name.clone(), task.clone(), start_movement.clone(), json_mode).await,

        Some(Commands::Piece(PieceCommands::List)) => {
            piece::list(ctx, json_mode).await?;
            Ok(0)
        }

        Some(Commands::Pipeline {
            task,
            piece,
            branch,
            auto_pr,
        }) => pipeline::execute(ctx, task.clone(), piece.clone(), branch.clone(), *auto_pr).await,

        Some(Commands::Ensemble | Commands::Repertoire) => {
            ensemble::execute(ctx, json_mode).await?;
            Ok(0)
        }

        Some(Commands::Eject { name }) => {
            eject::execute(ctx, name.clone(), json_mode).await?;
            Ok(0)
        }

        Some(Commands::ExportCc { piece, out_dir }) => {
            export_cc::execute(ctx, piece, out_dir.clone(), json_mode).await?;
            Ok(0)
        }

        None => {
            if cli.task.is_empty() {
                eprintln!("usage: takt <task-text|#N> | takt <subcommand>");
                return Ok(1);
            }
            let task_text = cli.task.join(" ");
            pipeline::execute(ctx, task_text, None, None, false).await
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Builtin pieces ship next to the binary (spec §1 "builtin resource file
/// contents" are out of scope; only their discovery path is owned here).
fn builtin_pieces_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join("resources").join("pieces")))
        .unwrap_or_else(|| PathBuf::from("resources/pieces"))
}
