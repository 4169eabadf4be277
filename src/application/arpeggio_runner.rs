//! Arpeggio runner — bounded-concurrency batch execution with retry and
//! deterministic merge by `batchIndex` (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::piece::ArpeggioConfig;

/// One unit of work pulled from the arpeggio data source, in source order.
#[derive(Debug, Clone)]
pub struct DataBatch {
    pub batch_index: usize,
    pub payload: serde_json::Value,
}

/// Pulls the finite, deterministically-ordered batch list for one arpeggio
/// movement (`source`/`sourcePath` resolution is source-specific and left to
/// the implementor).
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn load(&self, config: &ArpeggioConfig) -> EngineResult<Vec<DataBatch>>;
}

/// Expands the movement's template against one batch and calls the provider.
/// A retryable failure is either a non-`done` response or a provider error;
/// both surface as `Err` here so `run_arpeggio` can apply the retry policy
/// uniformly.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, batch: &DataBatch) -> EngineResult<String>;
}

/// Reduces the ordered, successful batch outputs to one merged string
/// (spec's "language-neutral reducer: concat, JSON-merge, etc").
pub trait Merger: Send + Sync {
    fn merge(&self, config: &ArpeggioConfig, ordered_outputs: &[String]) -> EngineResult<String>;
}

struct BatchResult {
    batch_index: usize,
    outcome: Result<String, String>,
}

/// Run `config` to completion: load batches, execute with bounded
/// concurrency and per-batch retry, then merge in `batchIndex` order.
pub async fn run_arpeggio(
    movement_name: &str,
    config: &ArpeggioConfig,
    source: &dyn BatchSource,
    executor: &dyn BatchExecutor,
    merger: &dyn Merger,
) -> EngineResult<String> {
    let batches = source.load(config).await?;
    if batches.is_empty() {
        return Err(EngineError::ArpeggioEmpty(movement_name.to_string()));
    }

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1) as usize));
    let results = join_all(batches.into_iter().map(|batch| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            run_one_batch_with_retries(&batch, config, executor).await
        }
    }))
    .await;

    let total = results.len();
    let mut failures: Vec<(usize, String)> = Vec::new();
    let mut ordered = results;
    ordered.sort_by_key(|r| r.batch_index);

    let mut outputs = Vec::with_capacity(total);
    for result in &ordered {
        match &result.outcome {
            Ok(output) => outputs.push(output.clone()),
            Err(err) => failures.push((result.batch_index, err.clone())),
        }
    }

    if !failures.is_empty() {
        let detail = failures
            .iter()
            .map(|(i, err)| format!("batch {i}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EngineError::ArpeggioFailed(failures.len(), total, detail));
    }

    merger.merge(config, &outputs)
}

async fn run_one_batch_with_retries(
    batch: &DataBatch,
    config: &ArpeggioConfig,
    executor: &dyn BatchExecutor,
) -> BatchResult {
    let mut last_error = String::new();
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
        }
        match executor.execute(batch).await {
            Ok(output) => {
                return BatchResult {
                    batch_index: batch.batch_index,
                    outcome: Ok(output),
                }
            }
            Err(err) => last_error = err.to_string(),
        }
    }
    BatchResult {
        batch_index: batch.batch_index,
        outcome: Err(last_error),
    }
}

/// Concatenates batch outputs in order, separated by a blank line.
pub struct ConcatMerger;

impl Merger for ConcatMerger {
    fn merge(&self, _config: &ArpeggioConfig, ordered_outputs: &[String]) -> EngineResult<String> {
        Ok(ordered_outputs.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ArpeggioConfig {
        ArpeggioConfig {
            source: "list".to_string(),
            source_path: "items.json".to_string(),
            batch_size: 1,
            concurrency: 2,
            max_retries: 2,
            retry_delay_ms: 1,
            template_path: "template.md".to_string(),
            merge: "concat".to_string(),
            output_path: None,
        }
    }

    struct FixedSource(Vec<DataBatch>);

    #[async_trait]
    impl BatchSource for FixedSource {
        async fn load(&self, _config: &ArpeggioConfig) -> EngineResult<Vec<DataBatch>> {
            Ok(self.0.clone())
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl BatchExecutor for AlwaysOk {
        async fn execute(&self, batch: &DataBatch) -> EngineResult<String> {
            Ok(format!("batch-{}", batch.batch_index))
        }
    }

    struct FailsUntilAttempt {
        succeed_on_attempt: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BatchExecutor for FailsUntilAttempt {
        async fn execute(&self, batch: &DataBatch) -> EngineResult<String> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt + 1 >= self.succeed_on_attempt {
                Ok(format!("batch-{}", batch.batch_index))
            } else {
                Err(EngineError::Provider("not ready".to_string()))
            }
        }
    }

    fn batches(n: usize) -> Vec<DataBatch> {
        (0..n)
            .map(|i| DataBatch {
                batch_index: i,
                payload: serde_json::json!({ "i": i }),
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_batch_list_is_fatal() {
        let source = FixedSource(vec![]);
        let result = run_arpeggio("fanout", &config(), &source, &AlwaysOk, &ConcatMerger).await;
        assert!(matches!(result, Err(EngineError::ArpeggioEmpty(_))));
    }

    #[tokio::test]
    async fn merges_in_batch_index_order() {
        let mut shuffled = batches(3);
        shuffled.reverse();
        let source = FixedSource(shuffled);
        let merged = run_arpeggio("fanout", &config(), &source, &AlwaysOk, &ConcatMerger)
            .await
            .unwrap();
        assert_eq!(merged, "batch-0\n\nbatch-1\n\nbatch-2");
    }

    #[tokio::test]
    async fn retries_up_to_max_then_succeeds() {
        let source = FixedSource(batches(1));
        let executor = FailsUntilAttempt {
            succeed_on_attempt: 3,
            attempts: AtomicUsize::new(0),
        };
        let merged = run_arpeggio("fanout", &config(), &source, &executor, &ConcatMerger)
            .await
            .unwrap();
        assert_eq!(merged, "batch-0");
    }

    #[tokio::test]
    async fn exhausting_retries_fails_the_movement() {
        let source = FixedSource(batches(2));
        let executor = FailsUntilAttempt {
            succeed_on_attempt: 100,
            attempts: AtomicUsize::new(0),
        };
        let result = run_arpeggio("fanout", &config(), &source, &executor, &ConcatMerger).await;
        match result {
            Err(EngineError::ArpeggioFailed(failed, total, _)) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 2);
            }
            other => panic!("expected ArpeggioFailed, got {other:?}"),
        }
    }
}
