//! Claude Code CLI provider adapter, grounded on the teacher's
//! `infrastructure::substrates::claude_code` substrate: shells out to the
//! `claude` CLI rather than calling an HTTP API.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::PermissionMode;
use crate::domain::models::piece_state::AgentResponse;
use crate::domain::ports::provider::{Provider, ProviderRequest};

use super::cli_executor::{self, CliInvocation};

/// Configuration for the Claude Code provider.
#[derive(Debug, Clone)]
pub struct ClaudeProviderConfig {
    pub cli_path: String,
    pub working_dir: Option<PathBuf>,
    pub default_timeout_secs: u64,
}

impl Default for ClaudeProviderConfig {
    fn default() -> Self {
        Self {
            cli_path: "claude".to_string(),
            working_dir: None,
            default_timeout_secs: 300,
        }
    }
}

pub struct ClaudeProvider {
    config: ClaudeProviderConfig,
}

impl ClaudeProvider {
    pub fn new(config: ClaudeProviderConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &ProviderRequest) -> Vec<String> {
        let mut args = vec!["--print".to_string(), "--output-format".to_string(), "json".to_string()];

        if let Some(session_id) = &request.session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(tools) = &request.allowed_tools {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
        match request.permission_mode {
            PermissionMode::SacrificeMyPc => args.push("--dangerously-skip-permissions".to_string()),
            PermissionMode::Readonly => {
                args.push("--permission-mode".to_string());
                args.push("readonly".to_string());
            }
            PermissionMode::Edit | PermissionMode::Default if !request.edit => {
                args.push("--permission-mode".to_string());
                args.push("plan".to_string());
            }
            PermissionMode::Edit | PermissionMode::Default => {}
        }

        args
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn execute(&self, request: ProviderRequest) -> EngineResult<AgentResponse> {
        if !cli_executor::is_available(&self.config.cli_path).await {
            return Err(EngineError::Provider(format!(
                "claude CLI not found at '{}'",
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
                "claude CLI exited with failure: {}",
                output.stderr
            )));
        }

        Ok(cli_executor::parse_envelope(&request.persona, &output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ProviderRequest {
        ProviderRequest {
            persona: "planner".to_string(),
            instruction: "plan the work".to_string(),
            session_id: None,
            allowed_tools: None,
            edit: false,
            permission_mode: PermissionMode::Default,
            model: None,
        }
    }

    #[test]
    fn build_args_includes_resume_and_model() {
        let provider = ClaudeProvider::new(ClaudeProviderConfig::default());
        let mut request = sample_request();
        request.session_id = Some("sess-1".to_string());
        request.model = Some("claude-opus".to_string());

        let args = provider.build_args(&request);
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
        assert!(args.windows(2).any(|w| w == ["--model", "claude-opus"]));
    }

    #[test]
    fn sacrifice_my_pc_skips_permission_prompts() {
        let provider = ClaudeProvider::new(ClaudeProviderConfig::default());
        let mut request = sample_request();
        request.permission_mode = PermissionMode::SacrificeMyPc;

        let args = provider.build_args(&request);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
    }
}
