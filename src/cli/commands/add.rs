//! `takt add` — enqueue a new task (spec §6, §3).

use anyhow::{bail, Result};
use serde::Serialize;

use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::task::{TaskContent, TaskRecord};
use crate::services::task_queue_service::YamlTaskStore;

#[derive(Serialize)]
pub struct AddOutput {
    pub name: String,
    pub piece: Option<String>,
    pub branch: Option<String>,
}

impl CommandOutput for AddOutput {
    fn to_human(&self) -> String {
        format!("Added task '{}'", self.name)
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    ctx: &AppContext,
    text: Option<String>,
    issue: Option<String>,
    piece: Option<String>,
    branch: Option<String>,
    auto_pr: bool,
    json_mode: bool,
) -> Result<()> {
    if text.is_none() && issue.is_none() {
        bail!("either a task text or --issue must be given");
    }
    if auto_pr && branch.is_none() {
        bail!("--auto-pr requires --branch");
    }

    let existing = ctx.task_store.list_tasks().await?;
    let first_line = text
        .as_deref()
        .map(|t| t.lines().next().unwrap_or(t).to_string())
        .unwrap_or_else(|| format!("issue-{}", issue.as_deref().unwrap_or("unknown")));
    let name = YamlTaskStore::slugify(&first_line, &existing);

    let content = match &text {
        Some(t) => TaskContent::Text(t.clone()),
        None => TaskContent::Text(format!(
            "GitHub issue #{}",
            issue.as_deref().unwrap_or("unknown")
        )),
    };

    let mut task = TaskRecord::new_pending(&name, content);
    task.piece = piece.clone();
    task.branch = branch.clone();
    task.issue = issue;
    task.auto_pr = auto_pr;

    ctx.task_store.add_task(task).await?;

    output(
        &AddOutput {
            name,
            piece,
            branch,
        },
        json_mode,
    );
    Ok(())
}
