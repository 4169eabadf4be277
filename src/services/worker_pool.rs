//! Bounded-concurrency polling loop over the task queue, with SIGINT
//! handling (spec §4.8, §5).
//!
//! The pool claims up to `concurrency - in_flight` pending tasks per poll,
//! spawns one worker per claimed task, and exits once no worker is in
//! flight and no pending task is observed over a full poll cycle. A shared
//! `AbortController`-style flag is installed on SIGINT: the first signal
//! stops the pool from starting new work (in-flight workers still finish,
//! cooperatively, via the same flag threaded through as the piece engine's
//! `abort_signal`); a second signal forces `exit(130)` (spec §4.8, §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::domain::errors::EngineResult;
use crate::domain::models::config::WorkerPoolConfig;
use crate::domain::models::task::{FailureInfo, TaskRecord, TaskStatus};
use crate::domain::ports::task_store::TaskStore;

/// Outcome of running one claimed task to completion.
pub enum TaskOutcome {
    Completed,
    Failed(FailureInfo),
}

/// Runs one task end-to-end (spec §4.9's pipeline orchestrator, from the
/// worker pool's point of view). `abort_signal` is the same cooperative flag
/// passed to `PieceEngineOptions` so in-flight provider calls are
/// interruptible even at `concurrency = 1` (spec §4.8).
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: TaskRecord, abort_signal: Arc<AtomicBool>) -> TaskOutcome;
}

/// Installs the SIGINT handler: first signal sets `abort`, second forces a
/// hard exit with code 130.
fn install_sigint_handler(abort: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if abort.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
        }
    });
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self { config }
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.clamp(1, 10) as usize
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.clamp(100, 5000))
    }

    /// Drive the pool to completion: recover interrupted tasks, then poll
    /// and claim until the queue is drained or an abort signal fires.
    pub async fn run(
        &self,
        task_store: Arc<dyn TaskStore>,
        runner: Arc<dyn TaskRunner>,
    ) -> EngineResult<()> {
        task_store.recover_interrupted_running_tasks().await?;

        let abort = Arc::new(AtomicBool::new(false));
        install_sigint_handler(abort.clone());

        let semaphore = Arc::new(Semaphore::new(self.concurrency()));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let pid = std::process::id();

        loop {
            handles.retain(|h| !h.is_finished());

            if abort.load(Ordering::SeqCst) {
                break;
            }

            let available = semaphore.available_permits();
            if available > 0 {
                let claimed = task_store.claim_next_tasks(available, pid).await?;
                for task in claimed {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore never closed");
                    let store = task_store.clone();
                    let runner = runner.clone();
                    let abort = abort.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        let name = task.name.clone();
                        match runner.run_task(task, abort).await {
                            TaskOutcome::Completed => {
                                let _ = store.complete_task(&name).await;
                            }
                            TaskOutcome::Failed(failure) => {
                                let _ = store.fail_task(&name, failure).await;
                            }
                        }
                    });
                    handles.push(handle);
                }
            }

            if handles.is_empty() {
                let pending_remaining = task_store
                    .list_tasks()
                    .await?
                    .iter()
                    .any(|t| t.status == TaskStatus::Pending);
                if !pending_remaining {
                    break;
                }
            }

            tokio::time::sleep(self.poll_interval()).await;
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
