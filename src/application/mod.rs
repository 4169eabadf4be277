//! Application layer: the piece engine and its direct collaborators.
//!
//! Pure orchestration logic over the domain model — no file I/O, no
//! subprocess spawning, no network calls. Everything here is driven through
//! ports (`Provider`, `EventSink`) supplied by `infrastructure`/`services`.

pub mod arpeggio_runner;
pub mod instruction_builder;
pub mod parallel_runner;
pub mod piece_engine;
pub mod rule_evaluator;

pub use piece_engine::{PieceEngine, PieceEngineOptions, PieceRunOutcome};
