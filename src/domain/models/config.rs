//! Resolved application configuration (SPEC_FULL §10.3).
//!
//! This is the merge target for `infrastructure::config`'s Figment chain:
//! built-in defaults, then `.takt/config.yaml`, then `TAKT_`-prefixed
//! environment variables. Piece YAML discovery is a separate, simpler
//! layering step and is not represented here.

use serde::{Deserialize, Serialize};

use super::piece::ProviderKind;

/// Worker pool tuning (spec §4.8: concurrency in `[1,10]`, poll interval in
/// `[100,5000]` ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub concurrency: u32,
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval_ms: 1000,
        }
    }
}

/// Provider credentials/paths, overridable by the four env vars spec §6 names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub opencode_api_key: Option<String>,
    pub codex_cli_path: Option<String>,
}

/// Top-level resolved configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub default_provider: ProviderKind,
    pub default_model: Option<String>,
    pub worker_pool: WorkerPoolConfig,
    pub clone_base_dir: Option<String>,
    #[serde(default)]
    pub providers: ProviderCredentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_provider: ProviderKind::Claude,
            default_model: None,
            worker_pool: WorkerPoolConfig::default(),
            clone_base_dir: None,
            providers: ProviderCredentials::default(),
        }
    }
}
