//! `ProviderFactory` wiring: resolves a `ProviderKind` to one of the
//! concrete adapters, built once from resolved `Config`.

use std::sync::Arc;

use crate::domain::models::config::Config;
use crate::domain::models::piece::ProviderKind;
use crate::domain::ports::provider::{Provider, ProviderFactory};

use super::claude::{ClaudeProvider, ClaudeProviderConfig};
use super::codex::{CodexProvider, CodexProviderConfig};
use super::mock::MockProvider;
use super::opencode::{OpenCodeProvider, OpenCodeProviderConfig};

/// Eagerly-constructed set of providers, selected by `ProviderKind` at call
/// time (spec §4.1 `options.provider`/`personaProviders`).
pub struct ProviderRegistry {
    claude: Arc<dyn Provider>,
    codex: Arc<dyn Provider>,
    opencode: Arc<dyn Provider>,
    mock: Arc<dyn Provider>,
}

impl ProviderRegistry {
    /// Build the registry from resolved configuration. The `mock` provider
    /// reads its scenario from `TAKT_MOCK_SCENARIO` at construction time.
    pub fn from_config(config: &Config) -> crate::domain::errors::EngineResult<Self> {
        let claude_config = ClaudeProviderConfig {
            cli_path: "claude".to_string(),
            working_dir: None,
            default_timeout_secs: 300,
        };
        let codex_config = CodexProviderConfig {
            cli_path: config
                .providers
                .codex_cli_path
                .clone()
                .unwrap_or_else(|| "codex".to_string()),
            working_dir: None,
            default_timeout_secs: 300,
        };
        let opencode_config = OpenCodeProviderConfig::default();

        Ok(Self {
            claude: Arc::new(ClaudeProvider::new(claude_config)),
            codex: Arc::new(CodexProvider::new(codex_config)),
            opencode: Arc::new(OpenCodeProvider::new(opencode_config)),
            mock: Arc::new(MockProvider::from_env()?),
        })
    }

    /// Build a registry whose `mock` provider is driven by `entries`
    /// directly (test convenience, bypassing `TAKT_MOCK_SCENARIO`).
    pub fn with_mock_entries(entries: Vec<super::mock::ScenarioEntry>) -> Self {
        Self {
            claude: Arc::new(ClaudeProvider::new(ClaudeProviderConfig::default())),
            codex: Arc::new(CodexProvider::new(CodexProviderConfig::default())),
            opencode: Arc::new(OpenCodeProvider::new(OpenCodeProviderConfig::default())),
            mock: Arc::new(MockProvider::from_entries(entries)),
        }
    }
}

impl ProviderFactory for ProviderRegistry {
    fn create(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        Some(match kind {
            ProviderKind::Claude => self.claude.clone(),
            ProviderKind::Codex => self.codex.clone(),
            ProviderKind::Opencode => self.opencode.clone(),
            ProviderKind::Mock => self.mock.clone(),
        })
    }
}
