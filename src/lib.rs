//! TAKT — orchestration engine that drives multi-agent LLM pipelines
//! ("pieces") against a working repository.
//!
//! A task (free-form instruction or GitHub issue reference) is handed to a
//! piece: a declarative graph of movements, each bound to a persona and
//! routed by declarative rules. Movements are delegated to an external
//! provider (Claude Code, Codex, OpenCode, or a mock), side effects are
//! isolated in git clones, and every run is persisted as an NDJSON audit log.

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{EngineError, EngineResult};
