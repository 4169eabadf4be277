//! Piece graph — the static, read-only configuration for a pipeline.
//!
//! A `Piece` is a named, immutable movement graph loaded from YAML (spec §3,
//! §6). It is read-only once loaded; runtime state lives in `PieceState`.

use serde::{Deserialize, Serialize};

/// Provider backend a movement can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Claude,
    Codex,
    Opencode,
    Mock,
}

/// Sandbox/tool permission level for a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    Default,
    Readonly,
    Edit,
    SacrificeMyPc,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Default
    }
}

/// How an aggregate rule combines sub-movement results (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    All,
    Any,
}

/// A declared Phase-2 output contract: one report file a movement must emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputContract {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub order: Option<u32>,
    pub format: Option<String>,
}

/// A single rule: `(condition, next)` plus optional aggregate semantics.
///
/// `condition` carries the raw YAML text (`plain`, `ai("…")`, `any("…")`,
/// `all("…")`); the rule evaluator (§4.2) interprets it according to
/// `is_ai`/`is_aggregate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: String,
    /// Next movement name, or the sentinels `COMPLETE`/`ABORT`. Absent only
    /// for aggregate-only rules attached to parallel sub-movements.
    pub next: Option<String>,
    pub appendix: Option<String>,
    #[serde(default)]
    pub is_ai: bool,
    #[serde(default)]
    pub is_aggregate: bool,
    pub aggregate_type: Option<AggregateType>,
    pub aggregate_text: Option<String>,
}

impl Rule {
    pub const COMPLETE: &'static str = "COMPLETE";
    pub const ABORT: &'static str = "ABORT";

    pub fn is_complete(&self) -> bool {
        self.next.as_deref() == Some(Self::COMPLETE)
    }

    pub fn is_abort(&self) -> bool {
        self.next.as_deref() == Some(Self::ABORT)
    }
}

/// Batch (arpeggio) configuration (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpeggioConfig {
    pub source: String,
    pub source_path: String,
    pub batch_size: u32,
    pub concurrency: u32,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub template_path: String,
    pub merge: String,
    pub output_path: Option<String>,
}

/// Decomposition hook points left open by spec §9 (open question: overlap
/// with arpeggio). Carried on the movement but not dispatched by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamLeaderConfig {
    pub persona: Option<String>,
    pub max_parts: u32,
    pub timeout_ms: u64,
    pub part_persona: Option<String>,
    pub part_allowed_tools: Option<Vec<String>>,
    pub part_edit: Option<bool>,
    pub part_permission_mode: Option<PermissionMode>,
}

/// A node in the piece graph (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub name: String,
    pub persona: String,
    pub persona_display_name: Option<String>,
    pub instruction_template: String,
    #[serde(default)]
    pub pass_previous_response: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub output_contracts: Vec<OutputContract>,
    /// Leaf sub-movements for a parallel parent. No nested parallel.
    #[serde(default)]
    pub parallel: Vec<Movement>,
    pub arpeggio: Option<ArpeggioConfig>,
    pub team_leader: Option<TeamLeaderConfig>,
    #[serde(default)]
    pub edit: bool,
    pub permission_mode: Option<PermissionMode>,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
}

impl Movement {
    pub fn is_parallel(&self) -> bool {
        !self.parallel.is_empty()
    }

    pub fn is_arpeggio(&self) -> bool {
        self.arpeggio.is_some()
    }

    /// True if any rule needs the Phase-3 status judgment tag. A one-rule
    /// movement auto-selects its only rule and never needs agent-based
    /// resolution of any kind (spec §4.2 stage 1, §8).
    pub fn needs_phase3(&self) -> bool {
        if self.rules.len() <= 1 {
            return false;
        }
        self.rules.iter().any(|r| !r.is_ai && !r.is_aggregate)
    }
}

/// A named, immutable configuration describing a graph of movements
/// (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub name: String,
    pub description: Option<String>,
    pub initial_movement: String,
    pub max_movements: u32,
    pub movements: Vec<Movement>,
}

impl Piece {
    /// Look up a movement by name. Missing name is a fatal configuration
    /// error per spec §4.1 step 3.
    pub fn movement(&self, name: &str) -> Option<&Movement> {
        self.movements.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_piece() -> Piece {
        Piece {
            name: "demo".to_string(),
            description: None,
            initial_movement: "plan".to_string(),
            max_movements: 10,
            movements: vec![Movement {
                name: "plan".to_string(),
                persona: "planner".to_string(),
                persona_display_name: None,
                instruction_template: "do the thing".to_string(),
                pass_previous_response: false,
                rules: vec![Rule {
                    condition: "done".to_string(),
                    next: Some("COMPLETE".to_string()),
                    appendix: None,
                    is_ai: false,
                    is_aggregate: false,
                    aggregate_type: None,
                    aggregate_text: None,
                }],
                output_contracts: vec![],
                parallel: vec![],
                arpeggio: None,
                team_leader: None,
                edit: false,
                permission_mode: None,
                provider: None,
                model: None,
            }],
        }
    }

    #[test]
    fn movement_lookup_by_name() {
        let piece = sample_piece();
        assert!(piece.movement("plan").is_some());
        assert!(piece.movement("missing").is_none());
    }

    #[test]
    fn rule_sentinel_detection() {
        let piece = sample_piece();
        let rule = &piece.movement("plan").unwrap().rules[0];
        assert!(rule.is_complete());
        assert!(!rule.is_abort());
    }

    #[test]
    fn one_rule_movement_skips_phase3() {
        let piece = sample_piece();
        assert!(!piece.movement("plan").unwrap().needs_phase3());
    }

    #[test]
    fn serde_roundtrip() {
        let piece = sample_piece();
        let yaml = serde_yaml::to_string(&piece).unwrap();
        let back: Piece = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(piece, back);
    }
}
