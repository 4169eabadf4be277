//! Parallel runner — fan-out/join over a movement's sub-movements and
//! `any`/`all` aggregate rule evaluation (spec §4.5).

use async_trait::async_trait;
use futures::future::join_all;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::{AggregateType, Movement};
use crate::domain::models::piece_state::AgentResponse;

/// Outcome of running one sub-movement to completion.
#[derive(Debug, Clone)]
pub struct SubMovementOutcome {
    pub name: String,
    pub response: AgentResponse,
    /// The condition text matched by the sub-movement's own Phase-1 rule
    /// scan (spec §4.2), if any. `None` for a failed sub-movement.
    pub matched_condition: Option<String>,
}

/// Runs a single sub-movement to completion. Implemented by `piece_engine`
/// against the full three-phase pipeline; failures are captured as an
/// `AgentResponse` with `status = error`, never propagated as `Err`, so a
/// failing sibling never poisons the join.
#[async_trait]
pub trait SubMovementRunner: Send + Sync {
    async fn run(&self, sub_movement: &Movement) -> (AgentResponse, Option<String>);
}

/// Run every leaf of `parent.parallel` concurrently (no per-group cap; k is
/// typically small), then resolve the parent's aggregate rules.
pub async fn run_parallel(
    parent: &Movement,
    runner: &dyn SubMovementRunner,
) -> EngineResult<(usize, Vec<SubMovementOutcome>)> {
    let outcomes = join_all(parent.parallel.iter().map(|sub| async move {
        let (response, matched_condition) = runner.run(sub).await;
        SubMovementOutcome {
            name: sub.name.clone(),
            response,
            matched_condition,
        }
    }))
    .await;

    let index = evaluate_aggregate(parent, &outcomes)?;
    Ok((index, outcomes))
}

/// Resolve the parent's aggregate rules against the sub-movement outcomes.
/// First matching rule (in declaration order) wins.
pub fn evaluate_aggregate(parent: &Movement, outcomes: &[SubMovementOutcome]) -> EngineResult<usize> {
    let successful: Vec<&SubMovementOutcome> = outcomes.iter().filter(|o| o.response.is_done()).collect();
    if successful.is_empty() {
        return Err(EngineError::AllSubMovementsFailed(parent.name.clone()));
    }

    for (index, rule) in parent.rules.iter().enumerate() {
        if !rule.is_aggregate {
            continue;
        }
        let Some(target) = rule.aggregate_text.as_deref() else {
            continue;
        };
        let matched = match rule.aggregate_type {
            Some(AggregateType::Any) => successful
                .iter()
                .any(|o| o.matched_condition.as_deref() == Some(target)),
            Some(AggregateType::All) => successful
                .iter()
                .all(|o| o.matched_condition.as_deref() == Some(target)),
            None => false,
        };
        if matched {
            return Ok(index);
        }
    }

    Err(EngineError::NoAggregateRuleMatched(parent.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::piece::{AggregateType, Movement, PermissionMode, Rule};
    use crate::domain::models::piece_state::{AgentResponse, AgentStatus};
    use chrono::Utc;

    fn aggregate_rule(aggregate_type: AggregateType, text: &str, next: &str) -> Rule {
        Rule {
            condition: format!("{text}-condition"),
            next: Some(next.to_string()),
            appendix: None,
            is_ai: false,
            is_aggregate: true,
            aggregate_type: Some(aggregate_type),
            aggregate_text: Some(text.to_string()),
        }
    }

    fn sub(name: &str) -> Movement {
        Movement {
            name: name.to_string(),
            persona: name.to_string(),
            persona_display_name: None,
            instruction_template: "review".to_string(),
            pass_previous_response: false,
            rules: vec![],
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

    fn parent_with_rules(rules: Vec<Rule>) -> Movement {
        let mut m = sub("reviewers");
        m.parallel = vec![sub("arch-review"), sub("security-review")];
        m.rules = rules;
        m
    }

    fn done(name: &str) -> AgentResponse {
        AgentResponse {
            persona: name.to_string(),
            status: AgentStatus::Done,
            content: String::new(),
            timestamp: Utc::now(),
            session_id: None,
            structured_output: None,
            matched_rule_index: None,
            matched_rule_method: None,
            error: None,
        }
    }

    #[test]
    fn any_rule_matches_when_one_sub_matches() {
        let parent = parent_with_rules(vec![aggregate_rule(AggregateType::Any, "done", "next-done")]);
        let outcomes = vec![
            SubMovementOutcome {
                name: "arch-review".to_string(),
                response: done("arch-review"),
                matched_condition: Some("done".to_string()),
            },
            SubMovementOutcome {
                name: "security-review".to_string(),
                response: AgentResponse::error("security-review", "boom"),
                matched_condition: None,
            },
        ];
        let index = evaluate_aggregate(&parent, &outcomes).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn all_sub_movements_failing_is_fatal() {
        let parent = parent_with_rules(vec![aggregate_rule(AggregateType::Any, "done", "next-done")]);
        let outcomes = vec![
            SubMovementOutcome {
                name: "arch-review".to_string(),
                response: AgentResponse::error("arch-review", "boom"),
                matched_condition: None,
            },
            SubMovementOutcome {
                name: "security-review".to_string(),
                response: AgentResponse::error("security-review", "boom"),
                matched_condition: None,
            },
        ];
        assert!(matches!(
            evaluate_aggregate(&parent, &outcomes),
            Err(EngineError::AllSubMovementsFailed(_))
        ));
    }

    #[test]
    fn all_rule_requires_every_surviving_sub_to_match() {
        let parent = parent_with_rules(vec![aggregate_rule(AggregateType::All, "needs_fix", "fix")]);
        let outcomes = vec![
            SubMovementOutcome {
                name: "arch-review".to_string(),
                response: done("arch-review"),
                matched_condition: Some("needs_fix".to_string()),
            },
            SubMovementOutcome {
                name: "security-review".to_string(),
                response: done("security-review"),
                matched_condition: Some("done".to_string()),
            },
        ];
        assert!(matches!(
            evaluate_aggregate(&parent, &outcomes),
            Err(EngineError::NoAggregateRuleMatched(_))
        ));
    }
}
