//! Event sink port — interface over the NDJSON session log (spec §4.1/§6/§9).

use async_trait::async_trait;

use crate::domain::errors::EngineResult;

/// Anything that can be appended to a piece run's NDJSON session log.
///
/// Implementations serialize `record` as one compact JSON line per spec §6's
/// record-kind taxonomy (`piece_start`, `movement_start`, `phase_start`,
/// `phase_complete`, `movement_complete`, `movement_report`,
/// `movement_blocked`, `movement_user_input`, `iteration_limit`,
/// `piece_complete`/`piece_abort`).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, record: serde_json::Value) -> EngineResult<()>;
}
