//! Configuration infrastructure (SPEC_FULL §10.3).
//!
//! Hierarchical configuration using `figment`: built-in defaults, then
//! `.takt/config.yaml`, then `TAKT_`-prefixed environment variables.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
