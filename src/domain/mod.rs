//! Domain layer for the TAKT orchestration engine.
//!
//! This module contains core business logic and domain models, framework-
//! agnostic and free of infrastructure concerns.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{EngineError, EngineResult};
