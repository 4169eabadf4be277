//! Runtime state for one piece run: `PieceState`, `AgentResponse`, and the
//! loop/cycle detectors (spec §3, §9).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceStatus {
    Running,
    Completed,
    Aborted,
}

/// Outcome of one phase/movement execution (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Done,
    Blocked,
    Error,
}

/// How a rule's `next` was resolved (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRuleMethod {
    Phase1Tag,
    Phase3Tag,
    StructuredOutput,
    AiJudge,
    Aggregate,
    AutoSelect,
}

/// A uniform response record from a provider call (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub persona: String,
    pub status: AgentStatus,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub structured_output: Option<serde_json::Value>,
    pub matched_rule_index: Option<usize>,
    pub matched_rule_method: Option<MatchedRuleMethod>,
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn error(persona: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            status: AgentStatus::Error,
            content: String::new(),
            timestamp: Utc::now(),
            session_id: None,
            structured_output: None,
            matched_rule_index: None,
            matched_rule_method: None,
            error: Some(error.into()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == AgentStatus::Done
    }
}

/// Runtime state of a piece run (spec §3).
///
/// Invariants: `iteration` monotonically increases by 1 per non-parallel
/// movement or per parallel fan-out; `sum(movement_iterations) <= iteration`;
/// `movement_outputs[m]` always holds the *last* response for movement `m`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceState {
    pub piece_name: String,
    pub current_movement: String,
    pub iteration: u32,
    pub movement_outputs: HashMap<String, AgentResponse>,
    pub user_inputs: Vec<String>,
    pub persona_sessions: HashMap<String, String>,
    pub movement_iterations: HashMap<String, u32>,
    pub status: PieceStatus,
}

/// Bounded FIFO cap on blocked-handling user input accumulation (spec §4.7).
pub const MAX_USER_INPUTS: usize = 20;
/// Max characters retained per user input entry.
pub const MAX_USER_INPUT_LEN: usize = 4000;

impl PieceState {
    pub fn new(piece_name: impl Into<String>, initial_movement: impl Into<String>) -> Self {
        Self {
            piece_name: piece_name.into(),
            current_movement: initial_movement.into(),
            iteration: 0,
            movement_outputs: HashMap::new(),
            user_inputs: Vec::new(),
            persona_sessions: HashMap::new(),
            movement_iterations: HashMap::new(),
            status: PieceStatus::Running,
        }
    }

    pub fn record_output(&mut self, movement: &str, response: AgentResponse) {
        self.movement_outputs.insert(movement.to_string(), response);
        *self.movement_iterations.entry(movement.to_string()).or_insert(0) += 1;
    }

    /// Append a user input, FIFO-evicting the oldest entry once at capacity
    /// and truncating overlong entries (spec §4.7).
    pub fn push_user_input(&mut self, mut input: String) {
        if input.len() > MAX_USER_INPUT_LEN {
            input.truncate(MAX_USER_INPUT_LEN);
        }
        if self.user_inputs.len() >= MAX_USER_INPUTS {
            self.user_inputs.remove(0);
        }
        self.user_inputs.push(input);
    }

    pub fn user_inputs_joined(&self) -> String {
        self.user_inputs.join("\n")
    }
}

/// Action taken when the loop detector's threshold is hit (spec §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    Abort,
    Warn,
    Ignore,
}

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    pub max_consecutive_same_movement: u32,
    pub action: LoopAction,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_same_movement: 3,
            action: LoopAction::Warn,
        }
    }
}

/// Counts consecutive same-named movement occurrences (spec §3, §8).
///
/// Fires on the `(m+1)`-th consecutive occurrence of the same movement name,
/// where `m = max_consecutive_same_movement`.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    last_movement: Option<String>,
    consecutive_count: u32,
    config: LoopDetectorConfig,
}

pub enum LoopCheck {
    Ok,
    ShouldWarn,
    ShouldAbort,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            last_movement: None,
            consecutive_count: 0,
            config,
        }
    }

    pub fn feed(&mut self, movement: &str) -> LoopCheck {
        if self.last_movement.as_deref() == Some(movement) {
            self.consecutive_count += 1;
        } else {
            self.last_movement = Some(movement.to_string());
            self.consecutive_count = 1;
        }

        if self.consecutive_count > self.config.max_consecutive_same_movement {
            match self.config.action {
                LoopAction::Abort => LoopCheck::ShouldAbort,
                LoopAction::Warn => LoopCheck::ShouldWarn,
                LoopAction::Ignore => LoopCheck::Ok,
            }
        } else {
            LoopCheck::Ok
        }
    }
}

#[derive(Debug, Clone)]
pub struct CyclePattern {
    pub cycle: Vec<String>,
    pub threshold: u32,
}

/// Matches a bounded sliding window of movement-name history against
/// configured cycle patterns (spec §3, §8).
///
/// A cycle of length N triggers after exactly `threshold` complete,
/// uninterrupted traversals of the pattern appear as the most recent suffix
/// of history.
#[derive(Debug, Clone)]
pub struct CycleDetector {
    history: Vec<String>,
    patterns: Vec<CyclePattern>,
    max_history: usize,
}

impl CycleDetector {
    pub fn new(patterns: Vec<CyclePattern>) -> Self {
        let max_history = patterns
            .iter()
            .map(|p| p.cycle.len() * (p.threshold as usize + 1))
            .max()
            .unwrap_or(0)
            .max(64);
        Self {
            history: Vec::new(),
            patterns,
            max_history,
        }
    }

    pub fn feed(&mut self, movement: &str) -> Option<&CyclePattern> {
        self.history.push(movement.to_string());
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(0..excess);
        }

        self.patterns.iter().find(|pattern| self.matches(pattern))
    }

    fn matches(&self, pattern: &CyclePattern) -> bool {
        if pattern.cycle.is_empty() || pattern.threshold == 0 {
            return false;
        }
        let needed = pattern.cycle.len() * pattern.threshold as usize;
        if self.history.len() < needed {
            return false;
        }
        let suffix = &self.history[self.history.len() - needed..];
        suffix
            .chunks_exact(pattern.cycle.len())
            .all(|chunk| chunk == pattern.cycle.as_slice())
    }
}
