//! `takt ensemble`/`takt repertoire` — list pieces visible across the
//! project/global/builtin layers (spec §6; "only their contracts with the
//! core are specified" — this is a thin discovery stub, see DESIGN.md).

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::cli::context::AppContext;
use crate::cli::output::{output, CommandOutput};

#[derive(Serialize)]
pub struct EnsembleOutput {
    pub pieces: Vec<String>,
}

impl CommandOutput for EnsembleOutput {
    fn to_human(&self) -> String {
        if self.pieces.is_empty() {
            return "No pieces found.".to_string();
        }
        self.pieces.join("\n")
    }
}

async fn yaml_stems(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_yaml = path.extension().is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_yaml {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
    }
    names
}

pub async fn execute(ctx: &AppContext, json_mode: bool) -> Result<()> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    names.extend(yaml_stems(&ctx.project_dir.join(".takt").join("pieces")).await);
    names.extend(yaml_stems(&ctx.global_pieces_dir).await);
    names.extend(yaml_stems(&ctx.builtin_pieces_dir).await);

    output(
        &EnsembleOutput {
            pieces: names.into_iter().collect(),
        },
        json_mode,
    );
    Ok(())
}
