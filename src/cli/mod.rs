//! CLI interface module
//!
//! This module contains the command-line surface (spec §6): command
//! definitions, the shared `AppContext` each subcommand is wired through,
//! and terminal output formatting (tables, progress bars). Interactive
//! TUI/prompt widgets are an external collaborator (spec §1 Out of scope)
//! and are not implemented here.

pub mod commands;
pub mod context;
pub mod output;
pub mod types;

pub use context::AppContext;
pub use types::{Cli, Commands, PieceCommands};
