//! Three-layer piece YAML resolution (spec Component B): project-local
//! pieces override global user pieces, which override builtin pieces.
//! Builtin resource file *contents* are out of scope (spec §1) — this
//! module only implements the layering and parse/validate steps, reading
//! whichever directory the caller configures as the builtin tier.

use std::path::{Path, PathBuf};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::{Movement, Piece, Rule};

/// Resolves piece names to `Piece` configurations across the three layers
/// laid out under `.takt/` (spec §6 persisted state layout).
pub struct PieceLoader {
    project_dir: PathBuf,
    global_dir: PathBuf,
    builtin_dir: PathBuf,
}

impl PieceLoader {
    pub fn new(project_dir: impl Into<PathBuf>, global_dir: impl Into<PathBuf>, builtin_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            global_dir: global_dir.into(),
            builtin_dir: builtin_dir.into(),
        }
    }

    /// Layout rooted at `project_dir/.takt/pieces`, `<global_dir>/pieces`,
    /// and `<builtin_dir>` respectively.
    pub fn for_project(project_dir: impl Into<PathBuf>, global_dir: impl Into<PathBuf>, builtin_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        Self::new(project_dir.join(".takt").join("pieces"), global_dir, builtin_dir)
    }

    fn candidate_paths(&self, name: &str) -> [PathBuf; 3] {
        let file = format!("{name}.yaml");
        [
            self.project_dir.join(&file),
            self.global_dir.join(&file),
            self.builtin_dir.join(&file),
        ]
    }

    /// First existing path across project/global/builtin, in that order.
    pub fn resolve_path(&self, name: &str) -> Option<PathBuf> {
        self.candidate_paths(name).into_iter().find(|p| p.is_file())
    }

    /// Load, parse, and validate the named piece.
    pub fn load(&self, name: &str) -> EngineResult<Piece> {
        let path = self
            .resolve_path(name)
            .ok_or_else(|| EngineError::Config(format!("piece not found: {name}")))?;
        self.load_from_path(&path)
    }

    /// Load a piece from an explicit path, bypassing layer resolution
    /// (used by `takt piece run <file>`-style CLI invocations).
    pub fn load_from_path(&self, path: &Path) -> EngineResult<Piece> {
        let raw = std::fs::read_to_string(path).map_err(EngineError::Io)?;
        let piece: Piece = serde_yaml::from_str(&raw).map_err(|source| EngineError::PieceYaml {
            path: path.display().to_string(),
            source,
        })?;
        validate_references(&piece)?;
        Ok(piece)
    }
}

/// Fatal configuration check (spec §4.1 step 3): `initial_movement` and
/// every rule `next` that isn't `COMPLETE`/`ABORT` must name a real
/// movement, including leaf names inside `parallel` groups.
fn validate_references(piece: &Piece) -> EngineResult<()> {
    if piece.movement(&piece.initial_movement).is_none() {
        return Err(EngineError::MovementNotFound(piece.initial_movement.clone()));
    }

    for movement in &piece.movements {
        validate_movement_rules(piece, movement)?;
        for sub_movement in &movement.parallel {
            validate_movement_rules(piece, sub_movement)?;
        }
    }

    Ok(())
}

fn validate_movement_rules(piece: &Piece, movement: &Movement) -> EngineResult<()> {
    for rule in &movement.rules {
        if let Some(target) = rule_target(rule) {
            if piece.movement(target).is_none() {
                return Err(EngineError::MovementNotFound(target.to_string()));
            }
        }
    }
    Ok(())
}

fn rule_target(rule: &Rule) -> Option<&str> {
    match rule.next.as_deref() {
        None | Some(Rule::COMPLETE) | Some(Rule::ABORT) => None,
        Some(target) => Some(target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_piece(dir: &Path, name: &str, yaml: &str) {
        let mut file = std::fs::File::create(dir.join(format!("{name}.yaml"))).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
    }

    const VALID_PIECE: &str = r#"
name: demo
initial_movement: plan
max_movements: 10
movements:
  - name: plan
    persona: planner
    instruction_template: "do it"
    rules:
      - condition: done
        next: COMPLETE
"#;

    #[test]
    fn project_layer_wins_over_global_and_builtin() {
        let project = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        let builtin = TempDir::new().unwrap();

        write_piece(project.path(), "demo", VALID_PIECE);
        write_piece(
            global.path(),
            "demo",
            &VALID_PIECE.replace("name: demo", "name: demo-global"),
        );

        let loader = PieceLoader::new(project.path(), global.path(), builtin.path());
        let piece = loader.load("demo").unwrap();
        assert_eq!(piece.name, "demo");
    }

    #[test]
    fn falls_back_to_global_then_builtin() {
        let project = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        let builtin = TempDir::new().unwrap();
        write_piece(builtin.path(), "demo", VALID_PIECE);

        let loader = PieceLoader::new(project.path(), global.path(), builtin.path());
        let piece = loader.load("demo").unwrap();
        assert_eq!(piece.name, "demo");
    }

    #[test]
    fn missing_piece_is_a_config_error() {
        let project = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        let builtin = TempDir::new().unwrap();
        let loader = PieceLoader::new(project.path(), global.path(), builtin.path());
        assert!(matches!(loader.load("missing"), Err(EngineError::Config(_))));
    }

    #[test]
    fn dangling_rule_target_is_rejected() {
        let project = TempDir::new().unwrap();
        let global = TempDir::new().unwrap();
        let builtin = TempDir::new().unwrap();
        write_piece(
            project.path(),
            "demo",
            &VALID_PIECE.replace("next: COMPLETE", "next: nonexistent"),
        );

        let loader = PieceLoader::new(project.path(), global.path(), builtin.path());
        assert!(matches!(
            loader.load("demo"),
            Err(EngineError::MovementNotFound(_))
        ));
    }
}
