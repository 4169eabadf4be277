//! Domain errors for the TAKT orchestration engine.

use thiserror::Error;

/// The fatal, recoverable-by-caller error taxonomy (see spec §7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("piece config error: {0}")]
    Config(String),

    #[error("movement not found: {0}")]
    MovementNotFound(String),

    #[error("malformed piece yaml at {path}: {source}")]
    PieceYaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("report path escapes report directory: {0}")]
    ReportPathEscape(String),

    #[error("no matching rule for movement {0}")]
    NoMatchingRule(String),

    #[error("no aggregate rule matched for movement {0}")]
    NoAggregateRuleMatched(String),

    #[error("all parallel sub-movements failed for movement {0}")]
    AllSubMovementsFailed(String),

    #[error("rule resolution failed for movement {0}: {1}")]
    RuleResolutionFailed(String, String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("{0}/{1} batches failed ({2})")]
    ArpeggioFailed(usize, usize, String),

    #[error("arpeggio movement {0} has zero batches")]
    ArpeggioEmpty(String),

    #[error("task queue schema violation: {0}")]
    TaskQueueSchema(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("clone lifecycle error: {0}")]
    Clone(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
