//! Codex CLI provider adapter. Same subprocess shape as the Claude adapter
//! (spec Component A treats every CLI provider uniformly); only the binary
//! name and flag vocabulary differ.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::PermissionMode;
use crate::domain::models::piece_state::AgentResponse;
use crate::domain::ports::provider::{Provider, ProviderRequest};

use super::cli_executor::{self, CliInvocation};

#[derive(Debug, Clone)]
pub struct CodexProviderConfig {
    pub cli_path: String,
    pub working_dir: Option<PathBuf>,
    pub default_timeout_secs: u64,
}

impl Default for CodexProviderConfig {
    fn default() -> Self {
        Self {
            cli_path: "codex".to_string(),
            working_dir: None,
            default_timeout_secs: 300,
        }
    }
}

pub struct CodexProvider {
    config: CodexProviderConfig,
}

impl CodexProvider {
    pub fn new(config: CodexProviderConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &ProviderRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--json".to_string()];

        if let Some(session_id) = &request.session_id {
            args.push("--session".to_string());
            args.push(session_id.clone());
        }
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        let sandbox = match request.permission_mode {
            PermissionMode::SacrificeMyPc => "danger-full-access",
            PermissionMode::Readonly => "read-only",
            PermissionMode::Edit | PermissionMode::Default if request.edit => "workspace-write",
            PermissionMode::Edit | PermissionMode::Default => "read-only",
        };
        args.push("--sandbox".to_string());
        args.push(sandbox.to_string());

        args
    }
}

#[async_trait]
impl Provider for CodexProvider {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn execute(&self, request: ProviderRequest) -> EngineResult<AgentResponse> {
        if !cli_executor::is_available(&self.config.cli_path).await {
            return Err(EngineError::Provider(format!(
                "codex CLI not found at '{}'",
                self.config.cli_path
            )));
        }

        let prompt = cli_executor::format_prompt(&request.persona, &request.instruction);
        let invocation = CliInvocation {
            program: self.config.cli_path.clone(),
            args: self.build_args(&request),
            cwd: self.config.working_dir.clone(),
            timeout: Duration::from_secs(self.config.default_timeout_secs),
        };

        let output = cli_executor::run(invocation, &prompt).await?;
        if !output.success {
            return Err(EngineError::Provider(format!(
                "codex CLI exited with failure: {}",
                output.stderr
            )));
        }

        Ok(cli_executor::parse_envelope(&request.persona, &output.stdout))
    }
}
