//! Rule evaluator — three-stage match (spec §4.2).
//!
//! Given a movement's Phase-1 content (and optional Phase-3 tag content),
//! resolves which rule fires next. Stages run in a fixed order; the first
//! stage to produce a valid in-range index wins.

use async_trait::async_trait;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::Movement;
use crate::domain::models::piece_state::MatchedRuleMethod;

/// A resolved rule: which index fired, and by which stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    pub index: usize,
    pub method: MatchedRuleMethod,
}

/// Result of asking the `conductor` persona to pick among numbered
/// conditions (stage 6). `matched_index` is 1-based per the evaluation
/// schema; `raw_text` is retained so a failed structured parse can still be
/// tag-scanned as free text.
#[derive(Debug, Clone, Default)]
pub struct JudgeOutcome {
    pub matched_index: Option<usize>,
    pub raw_text: String,
}

/// The agent-backed stages (4-6) of rule resolution: structured output,
/// tag-detection retry, and AI judgment over a numbered condition list.
/// Implemented by `piece_engine` against the resolved provider's `conductor`
/// persona.
#[async_trait]
pub trait Conductor: Send + Sync {
    /// Stage 4: ask for a 1-based `{step: int}` judgment via a fixed schema.
    async fn judge_step(&self, movement: &Movement) -> EngineResult<Option<usize>>;

    /// Stage 5: ask for a free-text status tag, no schema.
    async fn judge_tag(&self, movement: &Movement) -> EngineResult<Option<String>>;

    /// Stage 6: ask for a 1-based `matched_index` among the given condition
    /// texts.
    async fn judge_conditions(&self, conditions: &[&str]) -> EngineResult<JudgeOutcome>;
}

/// Scan `content` for the movement-scoped tag `[<MOVEMENT_UPPER>:N]` or the
/// judge tag `[JUDGE:N]`, case-insensitive. `N` is 1-based; `N = 0` or no
/// match yields `None`. Hand-rolled (no regex dependency): scans bracket
/// pairs left to right and returns the first tag whose prefix matches.
pub fn scan_tag(content: &str, movement_name: &str) -> Option<usize> {
    let movement_tag = movement_name.to_uppercase();
    scan_for_tags(content, &[movement_tag.as_str(), "JUDGE"])
}

fn scan_for_tags(content: &str, tags: &[&str]) -> Option<usize> {
    let upper = content.to_uppercase();
    let mut cursor = 0usize;
    while let Some(rel_start) = upper[cursor..].find('[') {
        let start = cursor + rel_start;
        let Some(rel_end) = upper[start..].find(']') else {
            break;
        };
        let end = start + rel_end;
        let inner = &upper[start + 1..end];
        if let Some((tag, rest)) = inner.split_once(':') {
            if tags.contains(&tag) {
                if let Ok(n) = rest.trim().parse::<usize>() {
                    if n >= 1 {
                        return Some(n);
                    }
                }
            }
        }
        cursor = end + 1;
    }
    None
}

/// Resolve the next rule for a non-parallel, non-aggregate movement
/// (spec §4.2). `phase3_content` is only consulted when
/// `movement.needs_phase3()`.
pub async fn evaluate(
    movement: &Movement,
    phase1_content: &str,
    phase3_content: Option<&str>,
    conductor: &dyn Conductor,
) -> EngineResult<RuleMatch> {
    let rule_count = movement.rules.len();
    if rule_count == 0 {
        return Err(EngineError::NoMatchingRule(movement.name.clone()));
    }
    if rule_count == 1 {
        return Ok(RuleMatch {
            index: 0,
            method: MatchedRuleMethod::AutoSelect,
        });
    }

    if let Some(index) = in_range(scan_tag(phase1_content, &movement.name), rule_count) {
        return Ok(RuleMatch {
            index,
            method: MatchedRuleMethod::Phase1Tag,
        });
    }

    if movement.needs_phase3() {
        if let Some(tag_content) = phase3_content {
            if let Some(index) = in_range(scan_tag(tag_content, &movement.name), rule_count) {
                return Ok(RuleMatch {
                    index,
                    method: MatchedRuleMethod::Phase3Tag,
                });
            }
        }
    }

    if movement.rules.iter().any(|r| r.is_ai) {
        if let Some(step) = conductor.judge_step(movement).await? {
            if let Some(index) = in_range(Some(step), rule_count) {
                return Ok(RuleMatch {
                    index,
                    method: MatchedRuleMethod::StructuredOutput,
                });
            }
        }

        if let Some(tag) = conductor.judge_tag(movement).await? {
            if let Some(index) = in_range(scan_tag(&tag, &movement.name), rule_count) {
                return Ok(RuleMatch {
                    index,
                    method: MatchedRuleMethod::Phase3Tag,
                });
            }
        }

        let conditions: Vec<&str> = movement.rules.iter().map(|r| r.condition.as_str()).collect();
        let outcome = conductor.judge_conditions(&conditions).await?;
        if let Some(index) = in_range(outcome.matched_index, rule_count) {
            return Ok(RuleMatch {
                index,
                method: MatchedRuleMethod::AiJudge,
            });
        }
        if let Some(index) = in_range(scan_tag(&outcome.raw_text, &movement.name), rule_count) {
            return Ok(RuleMatch {
                index,
                method: MatchedRuleMethod::Phase3Tag,
            });
        }
    }

    Err(EngineError::NoMatchingRule(movement.name.clone()))
}

/// Convert a 1-based candidate index into a validated 0-based one.
fn in_range(candidate: Option<usize>, rule_count: usize) -> Option<usize> {
    candidate.and_then(|n| if n >= 1 && n <= rule_count { Some(n - 1) } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::piece::{Movement, PermissionMode, Rule};

    struct NeverCalledConductor;

    #[async_trait]
    impl Conductor for NeverCalledConductor {
        async fn judge_step(&self, _movement: &Movement) -> EngineResult<Option<usize>> {
            panic!("conductor should not be consulted")
        }
        async fn judge_tag(&self, _movement: &Movement) -> EngineResult<Option<String>> {
            panic!("conductor should not be consulted")
        }
        async fn judge_conditions(&self, _conditions: &[&str]) -> EngineResult<JudgeOutcome> {
            panic!("conductor should not be consulted")
        }
    }

    fn rule(condition: &str, next: &str) -> Rule {
        Rule {
            condition: condition.to_string(),
            next: Some(next.to_string()),
            appendix: None,
            is_ai: false,
            is_aggregate: false,
            aggregate_type: None,
            aggregate_text: None,
        }
    }

    fn movement(name: &str, rules: Vec<Rule>) -> Movement {
        Movement {
            name: name.to_string(),
            persona: "planner".to_string(),
            persona_display_name: None,
            instruction_template: "do it".to_string(),
            pass_previous_response: false,
            rules,
            output_contracts: vec![],
            parallel: vec![],
            arpeggio: None,
            team_leader: None,
            edit: false,
            permission_mode: Some(PermissionMode::Default),
            provider: None,
            model: None,
        }
    }

    #[tokio::test]
    async fn one_rule_movement_auto_selects() {
        let m = movement("plan", vec![rule("done", "COMPLETE")]);
        let result = evaluate(&m, "anything", None, &NeverCalledConductor).await.unwrap();
        assert_eq!(result.index, 0);
        assert_eq!(result.method, MatchedRuleMethod::AutoSelect);
    }

    #[tokio::test]
    async fn phase1_tag_resolves_rule_index() {
        let m = movement("plan", vec![rule("a", "next-a"), rule("b", "next-b")]);
        let result = evaluate(&m, "status: [PLAN:2] done", None, &NeverCalledConductor)
            .await
            .unwrap();
        assert_eq!(result.index, 1);
        assert_eq!(result.method, MatchedRuleMethod::Phase1Tag);
    }

    #[tokio::test]
    async fn judge_tag_is_case_insensitive() {
        assert_eq!(scan_tag("see [judge:1] here", "plan"), Some(1));
    }

    #[tokio::test]
    async fn zero_tag_means_no_match() {
        assert_eq!(scan_tag("[PLAN:0]", "plan"), None);
    }

    #[tokio::test]
    async fn out_of_range_tag_falls_through_to_error() {
        let m = movement("plan", vec![rule("a", "next-a"), rule("b", "next-b")]);
        let err = evaluate(&m, "[PLAN:9]", None, &NeverCalledConductor).await.unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingRule(_)));
    }

    #[tokio::test]
    async fn empty_rules_is_fatal() {
        let m = movement("plan", vec![]);
        let err = evaluate(&m, "content", None, &NeverCalledConductor).await.unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingRule(_)));
    }
}
