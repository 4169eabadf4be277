//! Stateful, I/O-bound orchestration services for the TAKT engine.
//!
//! Where `application` holds pure orchestration logic, this layer owns the
//! side effects: the NDJSON session log and run directories, the task queue
//! file, the worker pool loop, isolated git clones, and the per-task
//! pipeline that wires them all together.

pub mod clone_lifecycle;
pub mod event_bus;
pub mod pipeline_orchestrator;
pub mod task_queue_service;
pub mod worker_pool;

pub use clone_lifecycle::{CloneLifecycle, CloneOptions};
pub use event_bus::{RunDirectory, RunMeta, SessionLog};
pub use pipeline_orchestrator::{PipelineConfig, PipelineOrchestrator};
pub use task_queue_service::YamlTaskStore;
pub use worker_pool::{TaskOutcome, TaskRunner, WorkerPool};
