//! Piece engine — the main loop (spec §4.1).
//!
//! Drives one piece run to completion: resolves the current movement,
//! dispatches it (three-phase / parallel / arpeggio), routes via the rule
//! evaluator, and emits NDJSON-shaped events through an `EventSink`. Provider
//! selection and session continuity are the engine's job; actual subprocess
//! invocation lives behind the `Provider` port.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::application::arpeggio_runner::{
    run_arpeggio, BatchExecutor, BatchSource, ConcatMerger, DataBatch, Merger,
};
use crate::application::instruction_builder::{render, InstructionContext};
use crate::application::parallel_runner::{run_parallel, SubMovementRunner};
use crate::application::rule_evaluator::{self, Conductor, JudgeOutcome, RuleMatch};
use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::{ArpeggioConfig, Movement, Piece, PermissionMode, ProviderKind};
use crate::domain::models::piece_state::{
    AgentResponse, AgentStatus, CycleDetector, CyclePattern, LoopCheck, LoopDetector,
    LoopDetectorConfig, MatchedRuleMethod, PieceState, PieceStatus,
};
use crate::domain::ports::event_sink::EventSink;
use crate::domain::ports::provider::{Provider, ProviderFactory, ProviderRequest};

/// Request passed to `PieceEngineCallbacks::on_user_input` (spec §4.7).
#[derive(Debug, Clone)]
pub struct UserInputRequest {
    pub movement: String,
    pub response: AgentResponse,
    pub prompt: String,
}

/// Request passed to `PieceEngineCallbacks::on_iteration_limit` (spec §4.7).
#[derive(Debug, Clone)]
pub struct IterationLimitRequest {
    pub current_iteration: u32,
    pub max_movements: u32,
    pub current_movement: String,
}

/// Callback surface for a piece run (spec §9: "a single configuration struct
/// with optional function fields... and default no-ops"). Implemented as a
/// trait with no-op defaults rather than an options struct of boxed closures,
/// since every callback here is async.
#[async_trait]
pub trait PieceEngineCallbacks: Send + Sync {
    /// Returns the new user input to append and retry, or `None` to abort.
    async fn on_user_input(&self, _request: UserInputRequest) -> Option<String> {
        None
    }

    /// Returns `Some(n)` to raise the iteration cap by `n`, or `None` to abort.
    async fn on_iteration_limit(&self, _request: IterationLimitRequest) -> Option<u32> {
        None
    }
}

/// Default callbacks: every blocked/limit condition aborts immediately.
pub struct NoopCallbacks;

#[async_trait]
impl PieceEngineCallbacks for NoopCallbacks {}

/// Per-run options (spec §4.1 `options`).
#[derive(Clone, Default)]
pub struct PieceEngineOptions {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub persona_providers: HashMap<String, ProviderKind>,
    pub initial_sessions: HashMap<String, String>,
    pub initial_user_inputs: Vec<String>,
    pub start_movement: Option<String>,
    pub retry_note: Option<String>,
    pub abort_signal: Option<Arc<AtomicBool>>,
}

impl PieceEngineOptions {
    fn is_aborted(&self) -> bool {
        self.abort_signal
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// The terminal result of one `PieceEngine::run` call.
#[derive(Debug, Clone)]
pub struct PieceRunOutcome {
    pub state: PieceState,
    pub abort_reason: Option<String>,
}

impl PieceRunOutcome {
    pub fn is_completed(&self) -> bool {
        self.state.status == PieceStatus::Completed
    }
}

/// Result of dispatching one movement, prior to being folded into `PieceState`.
struct DispatchOutcome {
    response: AgentResponse,
    rule_match: Option<RuleMatch>,
    extra_outputs: Vec<(String, AgentResponse)>,
    session_updates: Vec<(String, String)>,
}

/// Result of one three-phase execution (spec §4.3).
struct PhaseResult {
    response: AgentResponse,
    phase3_content: Option<String>,
}

pub struct PieceEngine<'a> {
    piece: &'a Piece,
    event_sink: &'a dyn EventSink,
    project_cwd: PathBuf,
    report_dir: PathBuf,
    context_dir: PathBuf,
}

impl<'a> PieceEngine<'a> {
    pub fn new(
        piece: &'a Piece,
        event_sink: &'a dyn EventSink,
        project_cwd: PathBuf,
        report_dir: PathBuf,
        context_dir: PathBuf,
    ) -> Self {
        Self {
            piece,
            event_sink,
            project_cwd,
            report_dir,
            context_dir,
        }
    }

    /// Run the piece to completion (spec §4.1).
    pub async fn run(
        &self,
        task: &str,
        provider_factory: &dyn ProviderFactory,
        callbacks: &dyn PieceEngineCallbacks,
        options: PieceEngineOptions,
    ) -> EngineResult<PieceRunOutcome> {
        let mut state = PieceState::new(
            self.piece.name.clone(),
            options
                .start_movement
                .clone()
                .unwrap_or_else(|| self.piece.initial_movement.clone()),
        );
        state.persona_sessions = options.initial_sessions.clone();
        for input in &options.initial_user_inputs {
            state.push_user_input(input.clone());
        }
        if let Some(note) = &options.retry_note {
            state.push_user_input(note.clone());
        }

        let mut max_movements = self.piece.max_movements;
        let mut loop_detector = LoopDetector::new(LoopDetectorConfig::default());
        let mut cycle_detector = CycleDetector::new(Vec::<CyclePattern>::new());
        let mut last_response_content: Option<String> = None;

        self.event_sink
            .record(json!({
                "type": "piece_start",
                "piece": self.piece.name,
                "task": task,
                "maxMovements": max_movements,
                "initialMovement": state.current_movement,
            }))
            .await?;

        loop {
            if options.is_aborted() {
                return self.abort(&mut state, "Aborted by signal").await;
            }

            if state.iteration >= max_movements {
                let request = IterationLimitRequest {
                    current_iteration: state.iteration,
                    max_movements,
                    current_movement: state.current_movement.clone(),
                };
                match callbacks.on_iteration_limit(request).await {
                    Some(extra) if extra > 0 => {
                        max_movements += extra;
                    }
                    _ => {
                        self.event_sink
                            .record(json!({
                                "type": "iteration_limit",
                                "iteration": state.iteration,
                                "maxMovements": max_movements,
                            }))
                            .await?;
                        return self.abort(&mut state, "Max iterations").await;
                    }
                }
            }

            match loop_detector.feed(&state.current_movement) {
                LoopCheck::ShouldAbort => {
                    let reason = format!("Loop detected in {}", state.current_movement);
                    return self.abort(&mut state, &reason).await;
                }
                LoopCheck::ShouldWarn => {
                    self.event_sink
                        .record(json!({
                            "type": "movement_loop_detected",
                            "movement": state.current_movement,
                        }))
                        .await?;
                }
                LoopCheck::Ok => {}
            }

            if let Some(pattern) = cycle_detector.feed(&state.current_movement).cloned() {
                self.event_sink
                    .record(json!({"type": "cycle_triggered", "cycle": pattern.cycle}))
                    .await?;
                match self
                    .route_on_cycle_trigger(&mut state, provider_factory, &options)
                    .await?
                {
                    CycleRoute::NoAction => {}
                    CycleRoute::Routed => continue,
                    CycleRoute::Completed => {
                        return Ok(PieceRunOutcome {
                            state: state.clone(),
                            abort_reason: None,
                        })
                    }
                    CycleRoute::Aborted(reason) => return self.abort(&mut state, &reason).await,
                }
            }

            let movement = self
                .piece
                .movement(&state.current_movement)
                .ok_or_else(|| EngineError::MovementNotFound(state.current_movement.clone()))?
                .clone();

            self.event_sink
                .record(json!({
                    "type": "movement_start",
                    "movement": movement.name,
                    "iteration": state.iteration,
                    "persona": movement.persona,
                }))
                .await?;

            let dispatch_result = if movement.is_arpeggio() {
                self.dispatch_arpeggio(&movement, task, provider_factory, &options)
                    .await
            } else if movement.is_parallel() {
                self.dispatch_parallel(
                    &movement,
                    task,
                    &state,
                    max_movements,
                    last_response_content.as_deref(),
                    provider_factory,
                    &options,
                )
                .await
            } else {
                self.dispatch_sequential(
                    &movement,
                    task,
                    &state,
                    max_movements,
                    last_response_content.as_deref(),
                    provider_factory,
                    &options,
                )
                .await
            };

            let outcome = match dispatch_result {
                Ok(outcome) => outcome,
                Err(err) => return self.abort(&mut state, &err.to_string()).await,
            };

            for (persona, session_id) in outcome.session_updates {
                state.persona_sessions.insert(persona, session_id);
            }
            for (name, response) in outcome.extra_outputs {
                state.record_output(&name, response);
            }
            state.record_output(&movement.name, outcome.response.clone());

            match outcome.response.status {
                AgentStatus::Error => {
                    let reason = outcome
                        .response
                        .error
                        .clone()
                        .unwrap_or_else(|| "movement error".to_string());
                    return self.abort(&mut state, &reason).await;
                }
                AgentStatus::Blocked => {
                    if self
                        .handle_blocked(&movement, &outcome.response, callbacks, &mut state)
                        .await?
                    {
                        // A retry re-runs the full three-phase pipeline for
                        // the same movement, i.e. another movement invocation
                        // (spec §3 `maxMovements` bounds total invocations,
                        // not distinct movement names), so it counts against
                        // the iteration cap the same as any other dispatch.
                        state.iteration += 1;
                        continue;
                    }
                    return self.abort(&mut state, "Blocked: no user input provided").await;
                }
                AgentStatus::Done => {
                    let Some(rule_match) = outcome.rule_match else {
                        let reason = format!("No matching rule for movement {}", movement.name);
                        return self.abort(&mut state, &reason).await;
                    };
                    let rule = &movement.rules[rule_match.index];
                    self.event_sink
                        .record(json!({
                            "type": "movement_complete",
                            "movement": movement.name,
                            "nextMovement": rule.next,
                            "matchedRule": rule_match.index,
                        }))
                        .await?;

                    if rule.is_complete() {
                        state.status = PieceStatus::Completed;
                        self.event_sink
                            .record(json!({"type":"piece_complete","status":"completed","iteration":state.iteration}))
                            .await?;
                        return Ok(PieceRunOutcome {
                            state,
                            abort_reason: None,
                        });
                    }
                    if rule.is_abort() {
                        return self.abort(&mut state, "Rule routed to ABORT").await;
                    }
                    let Some(next) = rule.next.clone() else {
                        let reason = format!("No matching rule for movement {}", movement.name);
                        return self.abort(&mut state, &reason).await;
                    };
                    last_response_content = Some(outcome.response.content.clone());
                    state.current_movement = next;
                    state.iteration += 1;
                }
            }
        }
    }

    async fn abort(&self, state: &mut PieceState, reason: &str) -> EngineResult<PieceRunOutcome> {
        state.status = PieceStatus::Aborted;
        self.event_sink
            .record(json!({"type": "piece_abort", "reason": reason}))
            .await?;
        Ok(PieceRunOutcome {
            state: state.clone(),
            abort_reason: Some(reason.to_string()),
        })
    }

    /// Routes directly from the last recorded output when a cycle pattern
    /// triggers, without re-running Phase 1 (spec §4.1 step 2, §9).
    /// `NoAction` means the movement has no recorded output yet or rule
    /// resolution failed, in which case the main loop falls through to a
    /// normal dispatch.
    async fn route_on_cycle_trigger(
        &self,
        state: &mut PieceState,
        provider_factory: &dyn ProviderFactory,
        options: &PieceEngineOptions,
    ) -> EngineResult<CycleRoute> {
        let Some(movement) = self.piece.movement(&state.current_movement).cloned() else {
            return Ok(CycleRoute::NoAction);
        };
        let Some(last) = state.movement_outputs.get(&movement.name).cloned() else {
            return Ok(CycleRoute::NoAction);
        };
        let provider = self.resolve_provider(&movement, options, provider_factory)?;
        let conductor = SessionConductor {
            provider: provider.as_ref(),
            persona: &movement.persona,
            session_id: Mutex::new(state.persona_sessions.get(&movement.persona).cloned()),
            model: options.model.clone().or_else(|| movement.model.clone()),
        };
        let Ok(rule_match) =
            rule_evaluator::evaluate(&movement, &last.content, None, &conductor).await
        else {
            return Ok(CycleRoute::NoAction);
        };
        let rule = &movement.rules[rule_match.index];
        if rule.is_complete() {
            state.status = PieceStatus::Completed;
            self.event_sink
                .record(json!({"type":"piece_complete","status":"completed","iteration":state.iteration}))
                .await?;
            return Ok(CycleRoute::Completed);
        }
        if rule.is_abort() {
            return Ok(CycleRoute::Aborted("Rule routed to ABORT".to_string()));
        }
        let Some(next) = rule.next.clone() else {
            return Ok(CycleRoute::NoAction);
        };
        state.current_movement = next;
        state.iteration += 1;
        Ok(CycleRoute::Routed)
    }

    fn resolve_provider(
        &self,
        movement: &Movement,
        options: &PieceEngineOptions,
        factory: &dyn ProviderFactory,
    ) -> EngineResult<Arc<dyn Provider>> {
        let kind = movement
            .provider
            .or_else(|| options.persona_providers.get(&movement.persona).copied())
            .or(options.provider)
            .unwrap_or(ProviderKind::Claude);
        factory
            .create(kind)
            .ok_or_else(|| EngineError::Config(format!("no provider registered for {kind:?}")))
    }

    async fn dispatch_sequential(
        &self,
        movement: &Movement,
        task: &str,
        state: &PieceState,
        max_movements: u32,
        last_response_content: Option<&str>,
        provider_factory: &dyn ProviderFactory,
        options: &PieceEngineOptions,
    ) -> EngineResult<DispatchOutcome> {
        let provider = self.resolve_provider(movement, options, provider_factory)?;
        let movement_iteration = state.movement_iterations.get(&movement.name).copied().unwrap_or(0) + 1;
        let previous_response = if movement.pass_previous_response {
            last_response_content
        } else {
            None
        };
        let starting_session = state.persona_sessions.get(&movement.persona).cloned();

        let phase_result = self
            .execute_three_phase(
                movement,
                task,
                state.iteration,
                max_movements,
                movement_iteration,
                previous_response,
                &state.user_inputs_joined(),
                starting_session,
                provider.as_ref(),
                options.model.clone().or_else(|| movement.model.clone()),
            )
            .await?;

        if phase_result.response.status != AgentStatus::Done {
            return Ok(DispatchOutcome {
                session_updates: phase_result
                    .response
                    .session_id
                    .clone()
                    .map(|sid| vec![(movement.persona.clone(), sid)])
                    .unwrap_or_default(),
                response: phase_result.response,
                rule_match: None,
                extra_outputs: Vec::new(),
            });
        }

        let conductor = SessionConductor {
            provider: provider.as_ref(),
            persona: &movement.persona,
            session_id: Mutex::new(phase_result.response.session_id.clone()),
            model: options.model.clone().or_else(|| movement.model.clone()),
        };
        let rule_match = rule_evaluator::evaluate(
            movement,
            &phase_result.response.content,
            phase_result.phase3_content.as_deref(),
            &conductor,
        )
        .await
        .ok();

        Ok(DispatchOutcome {
            session_updates: phase_result
                .response
                .session_id
                .clone()
                .map(|sid| vec![(movement.persona.clone(), sid)])
                .unwrap_or_default(),
            response: phase_result.response,
            rule_match,
            extra_outputs: Vec::new(),
        })
    }

    async fn dispatch_parallel(
        &self,
        movement: &Movement,
        task: &str,
        state: &PieceState,
        max_movements: u32,
        last_response_content: Option<&str>,
        provider_factory: &dyn ProviderFactory,
        options: &PieceEngineOptions,
    ) -> EngineResult<DispatchOutcome> {
        struct Runner<'e, 'f> {
            engine: &'e PieceEngine<'e>,
            task: &'f str,
            state: &'f PieceState,
            max_movements: u32,
            last_response_content: Option<&'f str>,
            provider_factory: &'f dyn ProviderFactory,
            options: &'f PieceEngineOptions,
        }

        #[async_trait]
        impl SubMovementRunner for Runner<'_, '_> {
            async fn run(&self, sub: &Movement) -> (AgentResponse, Option<String>) {
                match self
                    .engine
                    .dispatch_sequential(
                        sub,
                        self.task,
                        self.state,
                        self.max_movements,
                        self.last_response_content,
                        self.provider_factory,
                        self.options,
                    )
                    .await
                {
                    Ok(outcome) => {
                        let condition = outcome
                            .rule_match
                            .map(|rule_match| sub.rules[rule_match.index].condition.clone());
                        (outcome.response, condition)
                    }
                    Err(err) => (AgentResponse::error(sub.persona.clone(), err.to_string()), None),
                }
            }
        }

        let runner = Runner {
            engine: self,
            task,
            state,
            max_movements,
            last_response_content,
            provider_factory,
            options,
        };
        let (rule_index, outcomes) = run_parallel(movement, &runner).await?;

        let mut extra_outputs = Vec::with_capacity(outcomes.len());
        let mut session_updates = Vec::new();
        for outcome in outcomes {
            self.event_sink
                .record(json!({
                    "type": "movement_complete",
                    "movement": outcome.name,
                    "status": format!("{:?}", outcome.response.status),
                }))
                .await?;
            if let Some(session_id) = &outcome.response.session_id {
                session_updates.push((outcome.response.persona.clone(), session_id.clone()));
            }
            extra_outputs.push((outcome.name, outcome.response));
        }

        let aggregated = AgentResponse {
            persona: movement.persona.clone(),
            status: AgentStatus::Done,
            content: String::new(),
            timestamp: Utc::now(),
            session_id: None,
            structured_output: None,
            matched_rule_index: Some(rule_index),
            matched_rule_method: Some(MatchedRuleMethod::Aggregate),
            error: None,
        };

        Ok(DispatchOutcome {
            response: aggregated,
            rule_match: Some(RuleMatch {
                index: rule_index,
                method: MatchedRuleMethod::Aggregate,
            }),
            extra_outputs,
            session_updates,
        })
    }

    async fn dispatch_arpeggio(
        &self,
        movement: &Movement,
        task: &str,
        provider_factory: &dyn ProviderFactory,
        options: &PieceEngineOptions,
    ) -> EngineResult<DispatchOutcome> {
        let config = movement
            .arpeggio
            .as_ref()
            .expect("dispatch_arpeggio requires an arpeggio movement");
        let provider = self.resolve_provider(movement, options, provider_factory)?;
        let template_path = self.project_cwd.join(&config.template_path);
        let template = tokio::fs::read_to_string(&template_path).await?;

        let source = FileBatchSource {
            project_cwd: self.project_cwd.clone(),
        };
        let executor = TemplateBatchExecutor {
            movement,
            task,
            provider: provider.as_ref(),
            template,
        };
        let merger = merger_for(&config.merge);

        let merged = run_arpeggio(&movement.name, config, &source, &executor, merger.as_ref()).await?;

        if let Some(output_path) = &config.output_path {
            self.write_atomic(&self.project_cwd.join(output_path), &merged).await?;
        }

        let response = AgentResponse {
            persona: movement.persona.clone(),
            status: AgentStatus::Done,
            content: merged.clone(),
            timestamp: Utc::now(),
            session_id: None,
            structured_output: None,
            matched_rule_index: None,
            matched_rule_method: None,
            error: None,
        };

        let conductor = SessionConductor {
            provider: provider.as_ref(),
            persona: &movement.persona,
            session_id: Mutex::new(None),
            model: options.model.clone().or_else(|| movement.model.clone()),
        };
        let rule_match = rule_evaluator::evaluate(movement, &merged, None, &conductor).await.ok();

        Ok(DispatchOutcome {
            response,
            rule_match,
            extra_outputs: Vec::new(),
            session_updates: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_three_phase(
        &self,
        movement: &Movement,
        task: &str,
        iteration: u32,
        max_movements: u32,
        movement_iteration: u32,
        previous_response: Option<&str>,
        user_inputs: &str,
        starting_session: Option<String>,
        provider: &dyn Provider,
        model: Option<String>,
    ) -> EngineResult<PhaseResult> {
        let report_dir = self.report_dir.to_string_lossy().into_owned();
        let ctx = InstructionContext {
            task,
            iteration,
            max_movements,
            movement_iteration,
            previous_response,
            user_inputs,
            report_dir: &report_dir,
        };

        // Phase 1: main execution.
        let instruction = render(&movement.instruction_template, &ctx);
        let allowed_tools = if movement.output_contracts.is_empty() {
            None
        } else {
            Some(vec!["Read".to_string(), "Grep".to_string(), "Glob".to_string(), "Bash".to_string()])
        };
        self.event_sink
            .record(json!({"type":"phase_start","movement":movement.name,"phase":1,"name":"execute","instruction":instruction}))
            .await?;
        let response = match provider
            .execute(ProviderRequest {
                persona: movement.persona.clone(),
                instruction,
                session_id: starting_session,
                allowed_tools,
                edit: movement.edit,
                permission_mode: movement.permission_mode.unwrap_or_default(),
                model: model.clone(),
            })
            .await
        {
            Ok(response) => response,
            Err(err) => AgentResponse::error(movement.persona.clone(), err.to_string()),
        };
        self.event_sink
            .record(json!({"type":"phase_complete","movement":movement.name,"phase":1,"status":format!("{:?}",response.status),"content":response.content,"error":response.error}))
            .await?;

        if response.status != AgentStatus::Error {
            tokio::fs::create_dir_all(&self.context_dir).await?;
            let snapshot_path = self
                .context_dir
                .join(format!("{}-{}.md", movement.name, movement_iteration));
            tokio::fs::write(snapshot_path, &response.content).await?;
        }

        if response.status != AgentStatus::Done {
            return Ok(PhaseResult {
                response,
                phase3_content: None,
            });
        }

        let mut response = response;
        let mut phase3_content = None;

        // Phase 2: report output, iff the movement declares output contracts.
        if !movement.output_contracts.is_empty() {
            let names: Vec<&str> = movement.output_contracts.iter().map(|c| c.name.as_str()).collect();
            let instruction = format!(
                "Produce a JSON object mapping each of the following file names to its full content: {}. Respond with only the JSON object.",
                names.join(", ")
            );
            self.event_sink
                .record(json!({"type":"phase_start","movement":movement.name,"phase":2,"name":"report","instruction":instruction}))
                .await?;
            let report_response = match provider
                .execute(ProviderRequest {
                    persona: movement.persona.clone(),
                    instruction,
                    session_id: response.session_id.clone(),
                    allowed_tools: Some(Vec::new()),
                    edit: false,
                    permission_mode: PermissionMode::Readonly,
                    model: model.clone(),
                })
                .await
            {
                Ok(r) => r,
                Err(err) => AgentResponse::error(movement.persona.clone(), err.to_string()),
            };
            self.event_sink
                .record(json!({"type":"phase_complete","movement":movement.name,"phase":2,"status":format!("{:?}",report_response.status),"content":report_response.content,"error":report_response.error}))
                .await?;

            if report_response.status != AgentStatus::Done {
                return Ok(PhaseResult {
                    response: report_response,
                    phase3_content: None,
                });
            }

            let written = self
                .run_phase2_reports(movement, movement_iteration, &report_response.content)
                .await?;
            for (file_name, file_path) in written {
                self.event_sink
                    .record(json!({"type":"movement_report","movement":movement.name,"fileName":file_name,"filePath":file_path}))
                    .await?;
            }

            if report_response.session_id.is_some() {
                response.session_id = report_response.session_id;
            }
        }

        // Phase 3: status judgment, iff some rule needs tag detection and the
        // Phase-1 tag didn't already resolve a rule (spec §4.2 stage 1 runs
        // before stage 3; a movement whose Phase-1 content already carries
        // the routing tag must not burn an extra provider call, spec §8
        // scenario 1).
        let phase1_tag_resolved = rule_evaluator::scan_tag(&response.content, &movement.name)
            .is_some_and(|n| n >= 1 && n <= movement.rules.len());
        if movement.needs_phase3() && !phase1_tag_resolved {
            let instruction = format!(
                "State which rule applies as a bracket tag, e.g. [{}:N].",
                movement.name.to_uppercase()
            );
            self.event_sink
                .record(json!({"type":"phase_start","movement":movement.name,"phase":3,"name":"judge","instruction":instruction}))
                .await?;
            let judge_response = match provider
                .execute(ProviderRequest {
                    persona: movement.persona.clone(),
                    instruction,
                    session_id: response.session_id.clone(),
                    allowed_tools: Some(Vec::new()),
                    edit: false,
                    permission_mode: PermissionMode::Readonly,
                    model: model.clone(),
                })
                .await
            {
                Ok(r) => r,
                Err(err) => AgentResponse::error(movement.persona.clone(), err.to_string()),
            };
            self.event_sink
                .record(json!({"type":"phase_complete","movement":movement.name,"phase":3,"status":format!("{:?}",judge_response.status),"content":judge_response.content,"error":judge_response.error}))
                .await?;

            if judge_response.status != AgentStatus::Done {
                return Ok(PhaseResult {
                    response: judge_response,
                    phase3_content: None,
                });
            }

            phase3_content = Some(judge_response.content.clone());
            if judge_response.session_id.is_some() {
                response.session_id = judge_response.session_id;
            }
        }

        Ok(PhaseResult { response, phase3_content })
    }

    async fn run_phase2_reports(
        &self,
        movement: &Movement,
        movement_iteration: u32,
        report_json: &str,
    ) -> EngineResult<Vec<(String, String)>> {
        let parse_error = || EngineError::Config("Report output must be a JSON object mapping declared files to content".to_string());
        let value: serde_json::Value = serde_json::from_str(report_json).map_err(|_| parse_error())?;
        let serde_json::Value::Object(map) = value else {
            return Err(parse_error());
        };

        let declared: std::collections::HashSet<&str> =
            movement.output_contracts.iter().map(|c| c.name.as_str()).collect();

        let mut written = Vec::new();
        for (key, value) in &map {
            if !declared.contains(key.as_str()) {
                return Err(EngineError::Config(format!("Report output references undeclared file {key}")));
            }
            let serde_json::Value::String(content) = value else {
                return Err(EngineError::Config(format!("Report output for {key} must be a string")));
            };
            let path = self.write_report_file(key, movement_iteration, content).await?;
            written.push((key.clone(), path.to_string_lossy().into_owned()));
        }
        for contract in &movement.output_contracts {
            if !map.contains_key(&contract.name) {
                return Err(EngineError::Config(format!("Report output missing declared file {}", contract.name)));
            }
        }
        Ok(written)
    }

    async fn write_report_file(
        &self,
        name: &str,
        movement_iteration: u32,
        content: &str,
    ) -> EngineResult<PathBuf> {
        let escapes = std::path::Path::new(name)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
            || std::path::Path::new(name).is_absolute();
        if escapes {
            return Err(EngineError::ReportPathEscape(name.to_string()));
        }
        tokio::fs::create_dir_all(&self.report_dir).await?;
        let path = self.report_dir.join(name);
        let section = format!("## Iteration {movement_iteration}\n\n{content}\n\n");
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(section.as_bytes()).await?;
        Ok(path)
    }

    async fn write_atomic(&self, path: &std::path::Path, content: &str) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn handle_blocked(
        &self,
        movement: &Movement,
        response: &AgentResponse,
        callbacks: &dyn PieceEngineCallbacks,
        state: &mut PieceState,
    ) -> EngineResult<bool> {
        self.event_sink
            .record(json!({"type":"movement_blocked","movement":movement.name,"content":response.content}))
            .await?;
        let prompt = extract_blocked_prompt(&response.content);
        let request = UserInputRequest {
            movement: movement.name.clone(),
            response: response.clone(),
            prompt,
        };
        match callbacks.on_user_input(request).await {
            Some(input) => {
                state.push_user_input(input.clone());
                state.persona_sessions.remove(&movement.persona);
                self.event_sink
                    .record(json!({"type":"movement_user_input","movement":movement.name,"userInput":input}))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn extract_blocked_prompt(content: &str) -> String {
    let upper = content.to_uppercase();
    if let Some(idx) = upper.find("PROMPT:") {
        content[idx + "PROMPT:".len()..].trim().to_string()
    } else {
        content.trim().to_string()
    }
}

fn merger_for(kind: &str) -> Box<dyn Merger> {
    match kind {
        "json" | "json_merge" => Box::new(JsonArrayMerger),
        _ => Box::new(ConcatMerger),
    }
}

struct JsonArrayMerger;

impl Merger for JsonArrayMerger {
    fn merge(&self, _config: &ArpeggioConfig, ordered_outputs: &[String]) -> EngineResult<String> {
        let values: Vec<serde_json::Value> = ordered_outputs
            .iter()
            .map(|s| serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())))
            .collect();
        Ok(serde_json::to_string_pretty(&serde_json::Value::Array(values))?)
    }
}

struct FileBatchSource {
    project_cwd: PathBuf,
}

#[async_trait]
impl BatchSource for FileBatchSource {
    async fn load(&self, config: &ArpeggioConfig) -> EngineResult<Vec<DataBatch>> {
        let path = self.project_cwd.join(&config.source_path);
        let raw = tokio::fs::read_to_string(&path).await?;
        let items: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let batch_size = config.batch_size.max(1) as usize;
        Ok(items
            .chunks(batch_size)
            .enumerate()
            .map(|(index, chunk)| DataBatch {
                batch_index: index,
                payload: serde_json::Value::Array(chunk.to_vec()),
            })
            .collect())
    }
}

struct TemplateBatchExecutor<'a> {
    movement: &'a Movement,
    task: &'a str,
    provider: &'a dyn Provider,
    template: String,
}

#[async_trait]
impl BatchExecutor for TemplateBatchExecutor<'_> {
    async fn execute(&self, batch: &DataBatch) -> EngineResult<String> {
        let rendered = self
            .template
            .replace("{task}", self.task)
            .replace("{batch_index}", &batch.batch_index.to_string())
            .replace("{batch}", &batch.payload.to_string());
        let response = self
            .provider
            .execute(ProviderRequest {
                persona: self.movement.persona.clone(),
                instruction: rendered,
                session_id: None,
                allowed_tools: None,
                edit: self.movement.edit,
                permission_mode: self.movement.permission_mode.unwrap_or_default(),
                model: self.movement.model.clone(),
            })
            .await?;
        if response.status != AgentStatus::Done {
            return Err(EngineError::Provider(
                response.error.unwrap_or_else(|| "batch did not complete".to_string()),
            ));
        }
        Ok(response.content)
    }
}

/// Resumes a provider session to ask the stages-4/5/6 conductor questions
/// (spec §4.2). One instance is scoped to a single movement's rule
/// resolution; it is never shared across concurrent calls, so a plain
/// `Mutex` (not an async lock) around the session id is sufficient.
struct SessionConductor<'a> {
    provider: &'a dyn Provider,
    persona: &'a str,
    session_id: Mutex<Option<String>>,
    model: Option<String>,
}

impl SessionConductor<'_> {
    async fn ask(&self, instruction: &str) -> EngineResult<AgentResponse> {
        let session_id = self.session_id.lock().expect("session mutex poisoned").clone();
        let request = ProviderRequest {
            persona: self.persona.to_string(),
            instruction: instruction.to_string(),
            session_id,
            allowed_tools: Some(Vec::new()),
            edit: false,
            permission_mode: PermissionMode::Readonly,
            model: self.model.clone(),
        };
        let response = self.provider.execute(request).await?;
        *self.session_id.lock().expect("session mutex poisoned") = response.session_id.clone();
        Ok(response)
    }
}

#[async_trait]
impl Conductor for SessionConductor<'_> {
    async fn judge_step(&self, _movement: &Movement) -> EngineResult<Option<usize>> {
        let response = self
            .ask("Report which rule number (1-based) applies to your previous response, as JSON {\"step\": <int>}. Respond with only the JSON object.")
            .await?;
        Ok(extract_u64_field(&response, "step").map(|n| n as usize))
    }

    async fn judge_tag(&self, movement: &Movement) -> EngineResult<Option<String>> {
        let response = self
            .ask(&format!(
                "State a status tag in the form [{}:N] reflecting which rule applies.",
                movement.name.to_uppercase()
            ))
            .await?;
        let trimmed = response.content.trim();
        Ok(if trimmed.is_empty() { None } else { Some(trimmed.to_string()) })
    }

    async fn judge_conditions(&self, conditions: &[&str]) -> EngineResult<JudgeOutcome> {
        let listing = conditions
            .iter()
            .enumerate()
            .map(|(index, text)| format!("{}. {}", index + 1, text))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self
            .ask(&format!(
                "Given your previous response, pick which condition applies:\n{listing}\nRespond with JSON {{\"matched_index\": <int>}}."
            ))
            .await?;
        let matched_index = extract_u64_field(&response, "matched_index").map(|n| n as usize);
        Ok(JudgeOutcome {
            matched_index,
            raw_text: response.content.clone(),
        })
    }
}

fn extract_u64_field(response: &AgentResponse, field: &str) -> Option<u64> {
    response
        .structured_output
        .as_ref()
        .and_then(|value| value.get(field))
        .and_then(|value| value.as_u64())
        .or_else(|| {
            serde_json::from_str::<serde_json::Value>(response.content.trim())
                .ok()
                .and_then(|value| value.get(field).and_then(|v| v.as_u64()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::piece::{OutputContract, Rule};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct RecordingSink {
        events: StdMutex<Vec<serde_json::Value>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                events: StdMutex::new(Vec::new()),
            }
        }

        fn kinds(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| e.get("type").and_then(|t| t.as_str()).map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn record(&self, record: serde_json::Value) -> EngineResult<()> {
            self.events.lock().unwrap().push(record);
            Ok(())
        }
    }

    struct ScriptedProvider {
        queue: StdMutex<VecDeque<AgentResponse>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<AgentResponse>) -> Self {
            Self {
                queue: StdMutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, _request: ProviderRequest) -> EngineResult<AgentResponse> {
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EngineError::Provider("scripted queue exhausted".to_string()))
        }
    }

    struct SingleProviderFactory(Arc<dyn Provider>);

    impl ProviderFactory for SingleProviderFactory {
        fn create(&self, _kind: ProviderKind) -> Option<Arc<dyn Provider>> {
            Some(self.0.clone())
        }
    }

    fn done(persona: &str, content: &str) -> AgentResponse {
        AgentResponse {
            persona: persona.to_string(),
            status: AgentStatus::Done,
            content: content.to_string(),
            timestamp: Utc::now(),
            session_id: Some(format!("{persona}-session")),
            structured_output: None,
            matched_rule_index: None,
            matched_rule_method: None,
            error: None,
        }
    }

    fn blocked(persona: &str, content: &str) -> AgentResponse {
        AgentResponse {
            status: AgentStatus::Blocked,
            ..done(persona, content)
        }
    }

    fn demo_piece() -> Piece {
        Piece {
            name: "demo".to_string(),
            description: None,
            initial_movement: "plan".to_string(),
            max_movements: 10,
            movements: vec![
                Movement {
                    name: "plan".to_string(),
                    persona: "planner".to_string(),
                    persona_display_name: None,
                    instruction_template: "plan {task}".to_string(),
                    pass_previous_response: false,
                    rules: vec![
                        Rule {
                            condition: "ok".to_string(),
                            next: Some("implement".to_string()),
                            appendix: None,
                            is_ai: false,
                            is_aggregate: false,
                            aggregate_type: None,
                            aggregate_text: None,
                        },
                        Rule {
                            condition: "bad".to_string(),
                            next: Some(Rule::ABORT.to_string()),
                            appendix: None,
                            is_ai: false,
                            is_aggregate: false,
                            aggregate_type: None,
                            aggregate_text: None,
                        },
                    ],
                    output_contracts: vec![],
                    parallel: vec![],
                    arpeggio: None,
                    team_leader: None,
                    edit: false,
                    permission_mode: Some(PermissionMode::Default),
                    provider: None,
                    model: None,
                },
                Movement {
                    name: "implement".to_string(),
                    persona: "coder".to_string(),
                    persona_display_name: None,
                    instruction_template: "implement {task}".to_string(),
                    pass_previous_response: false,
                    rules: vec![Rule {
                        condition: "done".to_string(),
                        next: Some("review".to_string()),
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
                    edit: true,
                    permission_mode: Some(PermissionMode::Edit),
                    provider: None,
                    model: None,
                },
                Movement {
                    name: "review".to_string(),
                    persona: "reviewer".to_string(),
                    persona_display_name: None,
                    instruction_template: "review {task}".to_string(),
                    pass_previous_response: false,
                    rules: vec![Rule {
                        condition: "done".to_string(),
                        next: Some(Rule::COMPLETE.to_string()),
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
                    permission_mode: Some(PermissionMode::Readonly),
                    provider: None,
                    model: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn happy_path_sequential_completes_via_phase1_tags() {
        let dir = tempdir().unwrap();
        let piece = demo_piece();
        let sink = RecordingSink::new();
        let engine = PieceEngine::new(
            &piece,
            &sink,
            dir.path().to_path_buf(),
            dir.path().join("reports"),
            dir.path().join("context"),
        );
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![
            done("planner", "status [PLAN:1]"),
            done("coder", "status [IMPLEMENT:1]"),
            done("reviewer", "status [REVIEW:1]"),
        ]));
        let factory = SingleProviderFactory(provider);

        let outcome = engine
            .run("fix the bug", &factory, &NoopCallbacks, PieceEngineOptions::default())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert_eq!(
            sink.kinds().iter().filter(|k| *k == "movement_complete").count(),
            3
        );
    }

    #[tokio::test]
    async fn abort_rule_stops_the_run() {
        let dir = tempdir().unwrap();
        let piece = demo_piece();
        let sink = RecordingSink::new();
        let engine = PieceEngine::new(
            &piece,
            &sink,
            dir.path().to_path_buf(),
            dir.path().join("reports"),
            dir.path().join("context"),
        );
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![done(
            "planner",
            "status [PLAN:2]",
        )]));
        let factory = SingleProviderFactory(provider);

        let outcome = engine
            .run("fix the bug", &factory, &NoopCallbacks, PieceEngineOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state.status, PieceStatus::Aborted);
        assert!(outcome.abort_reason.unwrap().contains("ABORT"));
    }

    struct AlwaysRetry;

    #[async_trait]
    impl PieceEngineCallbacks for AlwaysRetry {
        async fn on_user_input(&self, _request: UserInputRequest) -> Option<String> {
            Some("add explicit types".to_string())
        }
    }

    #[tokio::test]
    async fn blocked_movement_retries_with_user_input() {
        let dir = tempdir().unwrap();
        let piece = demo_piece();
        let sink = RecordingSink::new();
        let engine = PieceEngine::new(
            &piece,
            &sink,
            dir.path().to_path_buf(),
            dir.path().join("reports"),
            dir.path().join("context"),
        );
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![
            blocked("planner", "PROMPT: need more context"),
            done("planner", "status [PLAN:1]"),
            done("coder", "status [IMPLEMENT:1]"),
            done("reviewer", "status [REVIEW:1]"),
        ]));
        let factory = SingleProviderFactory(provider);

        let outcome = engine
            .run("fix the bug", &factory, &AlwaysRetry, PieceEngineOptions::default())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        let kinds = sink.kinds();
        let blocked_idx = kinds.iter().position(|k| k == "movement_blocked").unwrap();
        let input_idx = kinds.iter().position(|k| k == "movement_user_input").unwrap();
        assert!(blocked_idx < input_idx);
    }

    #[tokio::test]
    async fn output_contracts_write_report_files() {
        let dir = tempdir().unwrap();
        let mut piece = demo_piece();
        piece.movements[0].output_contracts = vec![OutputContract {
            name: "plan.md".to_string(),
            label: None,
            description: None,
            order: None,
            format: None,
        }];
        let sink = RecordingSink::new();
        let reports_dir = dir.path().join("reports");
        let engine = PieceEngine::new(
            &piece,
            &sink,
            dir.path().to_path_buf(),
            reports_dir.clone(),
            dir.path().join("context"),
        );
        let provider: Arc<dyn Provider> = Arc::new(ScriptedProvider::new(vec![
            done("planner", "status [PLAN:1]"),
            done("planner", r#"{"plan.md": "the plan"}"#),
            done("coder", "status [IMPLEMENT:1]"),
            done("reviewer", "status [REVIEW:1]"),
        ]));
        let factory = SingleProviderFactory(provider);

        let outcome = engine
            .run("fix the bug", &factory, &NoopCallbacks, PieceEngineOptions::default())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        let content = std::fs::read_to_string(reports_dir.join("plan.md")).unwrap();
        assert!(content.contains("the plan"));
    }
}
