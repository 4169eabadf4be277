//! Logging infrastructure (SPEC_FULL §10.2).
//!
//! Structured logging via `tracing` + `tracing-subscriber` + `tracing-appender`
//! for the ambient human/operational log (process start/stop, config
//! resolution, worker pool lifecycle, subprocess invocations). This is
//! separate from the NDJSON *session* log spec §3/§6 mandates, which is a
//! domain artifact written by `services::event_bus`, not a `tracing`
//! subscriber output.

pub mod config;
pub mod logger;

pub use config::{LogConfig, LogFormat, RotationPolicy};
pub use logger::LoggerImpl;
