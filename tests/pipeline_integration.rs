//! End-to-end pipeline test: enqueue a task, run it through the worker pool
//! against a mock provider, and check the task queue records the result.
//!
//! Grounded on `tests/workflow_engine_integration.rs`'s `setup()` + temp
//! backing-store pattern, redirected at TAKT's file-backed task queue and
//! the `mock` provider instead of a SQLite repository.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tempfile::TempDir;

use takt::domain::models::config::WorkerPoolConfig;
use takt::domain::models::task::{TaskContent, TaskRecord, TaskStatus};
use takt::domain::ports::task_store::TaskStore;
use takt::infrastructure::piece_loader::PieceLoader;
use takt::infrastructure::providers::mock::ScenarioEntry;
use takt::infrastructure::providers::registry::ProviderRegistry;
use takt::services::pipeline_orchestrator::{PipelineConfig, PipelineOrchestrator};
use takt::services::task_queue_service::YamlTaskStore;
use takt::services::worker_pool::{TaskOutcome, TaskRunner, WorkerPool};

const SINGLE_MOVEMENT_PIECE: &str = r#"
name: demo
initial_movement: implement
max_movements: 5
movements:
  - name: implement
    persona: coder
    instruction_template: "{task}"
    rules:
      - condition: done
        next: COMPLETE
"#;

fn write_piece(dir: &Path, name: &str, yaml: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{name}.yaml")), yaml).unwrap();
}

fn setup(project: &TempDir, global: &TempDir, builtin: &TempDir) -> PipelineOrchestrator {
    write_piece(&project.path().join(".takt").join("pieces"), "demo", SINGLE_MOVEMENT_PIECE);

    let piece_loader = Arc::new(PieceLoader::for_project(
        project.path(),
        global.path(),
        builtin.path(),
    ));
    let provider_factory = Arc::new(ProviderRegistry::with_mock_entries(vec![ScenarioEntry {
        agent: Some("coder".to_string()),
        status: "done".to_string(),
        content: "implemented the change".to_string(),
    }]));

    PipelineOrchestrator::new(PipelineConfig {
        project_dir: project.path().to_path_buf(),
        piece_loader,
        provider_factory,
        default_piece: "demo".to_string(),
        default_provider: Some(takt::domain::models::piece::ProviderKind::Mock),
        default_model: None,
    })
}

#[tokio::test]
async fn completed_task_runs_to_completion_against_mock_provider() {
    let project = TempDir::new().unwrap();
    let global = TempDir::new().unwrap();
    let builtin = TempDir::new().unwrap();
    let orchestrator = setup(&project, &global, &builtin);

    let task = TaskRecord::new_pending("fix-bug", TaskContent::Text("fix the thing".to_string()));
    let outcome = orchestrator.run_task(task, Arc::new(AtomicBool::new(false))).await;

    assert!(matches!(outcome, TaskOutcome::Completed));
}

#[tokio::test]
async fn worker_pool_drains_a_queued_task_to_completion() {
    let project = TempDir::new().unwrap();
    let global = TempDir::new().unwrap();
    let builtin = TempDir::new().unwrap();
    let orchestrator = Arc::new(setup(&project, &global, &builtin));

    let store: Arc<dyn TaskStore> = Arc::new(YamlTaskStore::for_project(project.path()));
    store
        .add_task(TaskRecord::new_pending(
            "fix-bug",
            TaskContent::Text("fix the thing".to_string()),
        ))
        .await
        .unwrap();

    let pool = WorkerPool::new(WorkerPoolConfig {
        concurrency: 1,
        poll_interval_ms: 50,
    });
    pool.run(store.clone(), orchestrator).await.unwrap();

    let task = store.get_task("fix-bug").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}
