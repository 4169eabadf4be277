//! `takt export-cc` — export a piece's movements as Claude Code slash
//! command stubs (spec §6 thin stub; full Claude Code project integration
//! is out of scope, see DESIGN.md).

use anyhow::Result;
use serde::Serialize;

use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};

#[derive(Serialize)]
pub struct ExportCcOutput {
    pub out_dir: String,
    pub files: Vec<String>,
}

impl CommandOutput for ExportCcOutput {
    fn to_human(&self) -> String {
        format!(
            "Exported {} command(s) to {}",
            self.files.len(),
            self.out_dir
        )
    }
}

pub async fn execute(ctx: &AppContext, piece_name: &str, out_dir: Option<String>, json_mode: bool) -> Result<()> {
    let piece = ctx.piece_loader.load(piece_name)?;
    let out_dir = out_dir.unwrap_or_else(|| ".claude/commands".to_string());
    let out_path = ctx.project_dir.join(&out_dir);
    tokio::fs::create_dir_all(&out_path).await?;

    let mut files = Vec::new();
    for movement in &piece.movements {
        let file_name = format!("{}-{}.md", piece.name, movement.name);
        let body = format!(
            "---\ndescription: TAKT movement '{}' from piece '{}'\n---\n\n{}\n",
            movement.name, piece.name, movement.instruction_template
        );
        tokio::fs::write(out_path.join(&file_name), body).await?;
        files.push(file_name);
    }

    output(
        &ExportCcOutput {
            out_dir: out_path.to_string_lossy().into_owned(),
            files,
        },
        json_mode,
    );
    Ok(())
}
