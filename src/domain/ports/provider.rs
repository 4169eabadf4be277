//! Provider port — interface for LLM-backed agent execution (spec Component A).

use async_trait::async_trait;

use crate::domain::errors::EngineResult;
use crate::domain::models::piece_state::AgentResponse;

/// Input to one provider call: a fully-rendered instruction plus the session
/// to resume, if any (spec §4.3/§4.4).
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub persona: String,
    pub instruction: String,
    pub session_id: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub edit: bool,
    pub permission_mode: crate::domain::models::piece::PermissionMode,
    pub model: Option<String>,
}

/// A running or historical provider call.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifies the provider for logging and piece YAML `provider:` values.
    fn name(&self) -> &'static str;

    /// Run `request` to completion and return the uniform agent response.
    async fn execute(&self, request: ProviderRequest) -> EngineResult<AgentResponse>;
}

/// Resolves a `ProviderKind` to a concrete `Provider` implementation.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: crate::domain::models::piece::ProviderKind) -> Option<std::sync::Arc<dyn Provider>>;
}
