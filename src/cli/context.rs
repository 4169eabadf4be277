//! Wiring shared by every CLI command: resolved config, the task store, the
//! provider registry, and the three-layer piece loader.

use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::models::config::Config;
use crate::domain::ports::provider::ProviderFactory;
use crate::domain::ports::task_store::TaskStore;
use crate::infrastructure::piece_loader::PieceLoader;

pub struct AppContext {
    pub project_dir: PathBuf,
    pub global_pieces_dir: PathBuf,
    pub builtin_pieces_dir: PathBuf,
    pub config: Config,
    pub task_store: Arc<dyn TaskStore>,
    pub provider_factory: Arc<dyn ProviderFactory>,
    pub piece_loader: Arc<PieceLoader>,
}

impl AppContext {
    pub fn default_piece(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .unwrap_or_else(|| "default".to_string())
    }
}
