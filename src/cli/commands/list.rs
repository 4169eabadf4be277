//! `takt list` — show every task in the queue (spec §6).

use anyhow::Result;
use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::cli::context::AppContext;
use crate::cli::output::{output, truncate, CommandOutput};
use crate::domain::models::task::{TaskRecord, TaskStatus};

#[derive(Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub status: String,
    pub piece: Option<String>,
    pub branch: Option<String>,
}

impl From<&TaskRecord> for TaskSummary {
    fn from(task: &TaskRecord) -> Self {
        let status = match task.status {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        Self {
            name: task.name.clone(),
            status: status.to_string(),
            piece: task.piece.clone(),
            branch: task.branch.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct ListOutput {
    pub tasks: Vec<TaskSummary>,
}

impl CommandOutput for ListOutput {
    fn to_human(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks queued.".to_string();
        }

        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(["NAME", "STATUS", "PIECE", "BRANCH"].map(|h| Cell::new(h).set_alignment(CellAlignment::Left)));

        for task in &self.tasks {
            table.add_row([
                truncate(&task.name, 40),
                task.status.clone(),
                task.piece.clone().unwrap_or_else(|| "-".to_string()),
                task.branch.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }

        format!("{} task(s):\n{table}", self.tasks.len())
    }
}

pub async fn execute(ctx: &AppContext, json_mode: bool) -> Result<()> {
    let tasks = ctx.task_store.list_tasks().await?;
    let out = ListOutput {
        tasks: tasks.iter().map(TaskSummary::from).collect(),
    };
    output(&out, json_mode);
    Ok(())
}
