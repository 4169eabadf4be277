//! CLI type definitions (spec §6 CLI surface).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "takt")]
#[command(about = "TAKT - multi-agent LLM pipeline orchestration engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Output machine-readable JSON instead of human-readable text
    #[arg(long, global = true)]
    pub json: bool,

    /// Bare task text, or `#N` for a GitHub issue, when no subcommand is given
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub task: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drain the task queue with the worker pool until empty
    Run {
        /// Piece to use for tasks that don't name one
        #[arg(long)]
        piece: Option<String>,
    },

    /// Add a new task to the queue
    Add {
        /// Task text, or omitted when --issue is given
        text: Option<String>,
        /// GitHub issue number or `#N` reference to fetch as the task body
        #[arg(long)]
        issue: Option<String>,
        /// Piece to run this task with (defaults to the configured default)
        #[arg(long)]
        piece: Option<String>,
        /// Run this task in an isolated git clone on the given branch
        #[arg(long)]
        branch: Option<String>,
        /// Open a pull request automatically on success (requires --branch)
        #[arg(long)]
        auto_pr: bool,
    },

    /// List tasks in the queue
    List,

    /// Watch the task queue, reprinting on a fixed interval
    Watch {
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },

    /// Piece management
    #[command(subcommand)]
    Piece(PieceCommands),

    /// Run a single pipeline pass for one task (issue, text, or queued task name)
    Pipeline {
        /// Task text, `#N` issue reference, or the name of a queued task
        task: String,
        #[arg(long)]
        piece: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        auto_pr: bool,
    },

    /// List available pieces across project/global/builtin layers
    Ensemble,

    /// Alias for `ensemble`
    Repertoire,

    /// Copy a builtin or global piece into the project for editing
    Eject {
        /// Piece name to eject
        name: String,
    },

    /// Export piece definitions as Claude Code slash commands
    ExportCc {
        /// Piece to export
        piece: String,
        /// Output directory (defaults to `.claude/commands`)
        #[arg(long)]
        out_dir: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum PieceCommands {
    /// Run a specific piece directly against a task, bypassing the queue
    Run {
        name: String,
        task: String,
        #[arg(long)]
        start_movement: Option<String>,
    },
    /// List piece names visible from the current project
    List,
}
