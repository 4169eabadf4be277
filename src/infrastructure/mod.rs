//! Infrastructure layer: adapters over external systems.
//!
//! - `config` — hierarchical `.takt/config.yaml` + env var resolution.
//! - `logging` — ambient `tracing` setup (SPEC_FULL §10.2).
//! - `providers` — subprocess-backed `Provider` implementations (Claude,
//!   Codex, OpenCode) plus the scenario-driven `Mock`.
//! - `piece_loader` — three-layer project/global/builtin piece YAML
//!   resolution (spec Component B).

pub mod config;
pub mod logging;
pub mod piece_loader;
pub mod providers;
