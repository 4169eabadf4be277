//! `takt eject <name>` — copy a global or builtin piece into the project's
//! `.takt/pieces/` so it can be edited locally (spec §6 thin stub; see
//! DESIGN.md).

use anyhow::{bail, Result};
use serde::Serialize;

use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};

#[derive(Serialize)]
pub struct EjectOutput {
    pub name: String,
    pub path: String,
}

impl CommandOutput for EjectOutput {
    fn to_human(&self) -> String {
        format!("Ejected '{}' to {}", self.name, self.path)
    }
}

pub async fn execute(ctx: &AppContext, name: String, json_mode: bool) -> Result<()> {
    let file_name = format!("{name}.yaml");
    let project_path = ctx.project_dir.join(".takt").join("pieces").join(&file_name);
    if tokio::fs::try_exists(&project_path).await.unwrap_or(false) {
        bail!("'{name}' is already a project-local piece at {}", project_path.display());
    }

    let source = [
        ctx.global_pieces_dir.join(&file_name),
        ctx.builtin_pieces_dir.join(&file_name),
    ]
    .into_iter()
    .find(|p| p.is_file())
    .ok_or_else(|| anyhow::anyhow!("piece not found in global or builtin layers: {name}"))?;

    if let Some(parent) = project_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&source, &project_path).await?;

    output(
        &EjectOutput {
            name,
            path: project_path.to_string_lossy().into_owned(),
        },
        json_mode,
    );
    Ok(())
}
