//! Deterministic mock provider, grounded on the teacher's
//! `adapters::substrates::mock::MockSubstrate` pattern but redirected at
//! spec §6's `TAKT_MOCK_SCENARIO` contract: a JSON array of
//! `{agent?, status, content}` entries consumed FIFO, agent-specific first,
//! then unspecified.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece_state::{AgentResponse, AgentStatus};
use crate::domain::ports::provider::{Provider, ProviderRequest};

/// One scripted response in a `TAKT_MOCK_SCENARIO` file.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioEntry {
    pub agent: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub content: String,
}

fn default_status() -> String {
    "done".to_string()
}

fn entry_status(entry: &ScenarioEntry) -> AgentStatus {
    match entry.status.as_str() {
        "blocked" => AgentStatus::Blocked,
        "error" => AgentStatus::Error,
        _ => AgentStatus::Done,
    }
}

struct MockState {
    per_agent: HashMap<String, VecDeque<ScenarioEntry>>,
    unspecified: VecDeque<ScenarioEntry>,
}

/// Scenario-driven fake provider used by integration tests and by
/// `--provider mock` CLI runs.
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn empty() -> Self {
        Self {
            state: Mutex::new(MockState {
                per_agent: HashMap::new(),
                unspecified: VecDeque::new(),
            }),
        }
    }

    pub fn from_entries(entries: Vec<ScenarioEntry>) -> Self {
        let mut per_agent: HashMap<String, VecDeque<ScenarioEntry>> = HashMap::new();
        let mut unspecified = VecDeque::new();
        for entry in entries {
            match &entry.agent {
                Some(agent) => per_agent.entry(agent.clone()).or_default().push_back(entry),
                None => unspecified.push_back(entry),
            }
        }
        Self {
            state: Mutex::new(MockState {
                per_agent,
                unspecified,
            }),
        }
    }

    /// Load a scenario from the file named by `TAKT_MOCK_SCENARIO`, or an
    /// empty scenario if the variable is unset.
    pub fn from_env() -> EngineResult<Self> {
        match std::env::var_os("TAKT_MOCK_SCENARIO") {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::empty()),
        }
    }

    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(EngineError::Io)?;
        let entries: Vec<ScenarioEntry> =
            serde_json::from_str(&raw).map_err(EngineError::Serialization)?;
        Ok(Self::from_entries(entries))
    }

    async fn next_for(&self, persona: &str) -> Option<ScenarioEntry> {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.per_agent.get_mut(persona) {
            if let Some(entry) = queue.pop_front() {
                return Some(entry);
            }
        }
        state.unspecified.pop_front()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, request: ProviderRequest) -> EngineResult<AgentResponse> {
        let entry = self.next_for(&request.persona).await;

        let response = match entry {
            Some(entry) => {
                let status = entry_status(&entry);
                AgentResponse {
                    persona: request.persona,
                    status,
                    content: entry.content.clone(),
                    timestamp: Utc::now(),
                    session_id: Some(format!("mock-session-{}", uuid::Uuid::new_v4())),
                    structured_output: None,
                    matched_rule_index: None,
                    matched_rule_method: None,
                    error: if status == AgentStatus::Error {
                        Some(entry.content)
                    } else {
                        None
                    },
                }
            }
            None => AgentResponse {
                persona: request.persona,
                status: AgentStatus::Done,
                content: "mock task completed successfully".to_string(),
                timestamp: Utc::now(),
                session_id: Some(format!("mock-session-{}", uuid::Uuid::new_v4())),
                structured_output: None,
                matched_rule_index: None,
                matched_rule_method: None,
                error: None,
            },
        };

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::piece::PermissionMode;

    fn request_for(persona: &str) -> ProviderRequest {
        ProviderRequest {
            persona: persona.to_string(),
            instruction: "do it".to_string(),
            session_id: None,
            allowed_tools: None,
            edit: false,
            permission_mode: PermissionMode::Default,
            model: None,
        }
    }

    #[tokio::test]
    async fn agent_specific_entries_are_consumed_before_unspecified() {
        let provider = MockProvider::from_entries(vec![
            ScenarioEntry {
                agent: None,
                status: "done".to_string(),
                content: "generic".to_string(),
            },
            ScenarioEntry {
                agent: Some("planner".to_string()),
                status: "done".to_string(),
                content: "[PLAN:1]".to_string(),
            },
        ]);

        let response = provider.execute(request_for("planner")).await.unwrap();
        assert_eq!(response.content, "[PLAN:1]");

        let response = provider.execute(request_for("planner")).await.unwrap();
        assert_eq!(response.content, "generic");
    }

    #[tokio::test]
    async fn fifo_order_within_a_persona() {
        let provider = MockProvider::from_entries(vec![
            ScenarioEntry {
                agent: Some("coder".to_string()),
                status: "done".to_string(),
                content: "first".to_string(),
            },
            ScenarioEntry {
                agent: Some("coder".to_string()),
                status: "done".to_string(),
                content: "second".to_string(),
            },
        ]);

        assert_eq!(
            provider.execute(request_for("coder")).await.unwrap().content,
            "first"
        );
        assert_eq!(
            provider.execute(request_for("coder")).await.unwrap().content,
            "second"
        );
    }

    #[tokio::test]
    async fn error_status_populates_error_field() {
        let provider = MockProvider::from_entries(vec![ScenarioEntry {
            agent: Some("reviewer".to_string()),
            status: "error".to_string(),
            content: "boom".to_string(),
        }]);

        let response = provider.execute(request_for("reviewer")).await.unwrap();
        assert_eq!(response.status, AgentStatus::Error);
        assert_eq!(response.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn empty_scenario_yields_default_done_response() {
        let provider = MockProvider::empty();
        let response = provider.execute(request_for("anyone")).await.unwrap();
        assert_eq!(response.status, AgentStatus::Done);
    }
}
