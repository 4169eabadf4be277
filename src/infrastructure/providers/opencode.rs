//! OpenCode CLI provider adapter. Same subprocess shape as the other CLI
//! providers (spec Component A).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::PermissionMode;
use crate::domain::models::piece_state::AgentResponse;
use crate::domain::ports::provider::{Provider, ProviderRequest};

use super::cli_executor::{self, CliInvocation};

#[derive(Debug, Clone)]
pub struct OpenCodeProviderConfig {
    pub cli_path: String,
    pub working_dir: Option<PathBuf>,
    pub default_timeout_secs: u64,
}

impl Default for OpenCodeProviderConfig {
    fn default() -> Self {
        Self {
            cli_path: "opencode".to_string(),
            working_dir: None,
            default_timeout_secs: 300,
        }
    }
}

pub struct OpenCodeProvider {
    config: OpenCodeProviderConfig,
}

impl OpenCodeProvider {
    pub fn new(config: OpenCodeProviderConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &ProviderRequest) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--format".to_string(), "json".to_string()];

        if let Some(session_id) = &request.session_id {
            args.push("--continue".to_string());
            args.push(session_id.clone());
        }
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if !request.edit || matches!(request.permission_mode, PermissionMode::Readonly) {
            args.push("--read-only".to_string());
        }
        if matches!(request.permission_mode, PermissionMode::SacrificeMyPc) {
            args.push("--yolo".to_string());
        }

        args
    }
}

#[async_trait]
impl Provider for OpenCodeProvider {
    fn name(&self) -> &'static str {
        "opencode"
    }

    async fn execute(&self, request: ProviderRequest) -> EngineResult<AgentResponse> {
        if !cli_executor::is_available(&self.config.cli_path).await {
            return Err(EngineError::Provider(format!(
                "opencode CLI not found at '{}'",
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
                "opencode CLI exited with failure: {}",
                output.stderr
            )));
        }

        Ok(cli_executor::parse_envelope(&request.persona, &output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sacrifice_my_pc_sets_yolo_flag() {
        let provider = OpenCodeProvider::new(OpenCodeProviderConfig::default());
        let request = ProviderRequest {
            persona: "implementer".to_string(),
            instruction: "go".to_string(),
            session_id: None,
            allowed_tools: None,
            edit: true,
            permission_mode: PermissionMode::SacrificeMyPc,
            model: None,
        };

        let args = provider.build_args(&request);
        assert!(args.contains(&"--yolo".to_string()));
    }
}
