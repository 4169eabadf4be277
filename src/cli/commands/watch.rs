//! `takt watch` — repeatedly render the task queue until interrupted
//! (spec §6).

use anyhow::Result;
use console::Term;
use std::time::Duration;

use crate::cli::commands::list::{ListOutput, TaskSummary};
use crate::cli::context::AppContext;
use crate::cli::output::CommandOutput;

pub async fn execute(ctx: &AppContext, interval_ms: u64, json_mode: bool) -> Result<()> {
    let term = Term::stdout();
    let interval = Duration::from_millis(interval_ms.clamp(100, 60_000));

    loop {
        let tasks = ctx.task_store.list_tasks().await?;
        let out = ListOutput {
            tasks: tasks.iter().map(TaskSummary::from).collect(),
        };

        let _ = term.clear_screen();
        if json_mode {
            println!("{}", serde_json::to_string_pretty(&out.to_json()).unwrap_or_default());
        } else {
            println!("{}", out.to_human());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
