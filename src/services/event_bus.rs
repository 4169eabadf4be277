//! NDJSON session log + run directory/`meta.json` persistence (spec §3, §4.1,
//! §6, §9).
//!
//! One `SessionLog` per run directory: appends each engine record as one
//! compact JSON line to `logs/<slug>.jsonl` (append-only, single writer per
//! spec §5) and broadcasts the same record to any live subscriber (spec §9
//! Design Notes: "a typed event type... delivered via a synchronous
//! broadcaster with one-shot and persistent subscribers"). `RunDirectory`
//! owns the rest of the run's on-disk layout: `meta.json`, `reports/`, and
//! `context/previous_responses/` (the latter two are written directly by the
//! piece engine; this module only creates the directories and persists the
//! meta file).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

use async_trait::async_trait;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::event_sink::EventSink;

/// Per-run `meta.json` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub task: String,
    pub piece: String,
    pub status: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "logsDirectory")]
    pub logs_directory: String,
    #[serde(rename = "reportDirectory")]
    pub report_directory: String,
    #[serde(rename = "runSlug")]
    pub run_slug: String,
}

/// The on-disk layout for one piece run: `.takt/runs/<slug>/{meta.json,
/// logs/, reports/, context/previous_responses/}` (spec §3, §6).
#[derive(Debug, Clone)]
pub struct RunDirectory {
    pub root: PathBuf,
    pub logs_dir: PathBuf,
    pub report_dir: PathBuf,
    pub context_dir: PathBuf,
    pub slug: String,
}

impl RunDirectory {
    /// Create the directory tree for a new run under `<project_dir>/.takt/runs/<slug>`.
    pub async fn create(project_dir: &Path, slug: &str) -> EngineResult<Self> {
        let root = project_dir.join(".takt").join("runs").join(slug);
        let logs_dir = root.join("logs");
        let report_dir = root.join("reports");
        let context_dir = root.join("context").join("previous_responses");

        tokio::fs::create_dir_all(&logs_dir).await?;
        tokio::fs::create_dir_all(&report_dir).await?;
        tokio::fs::create_dir_all(&context_dir).await?;

        Ok(Self {
            root,
            logs_dir,
            report_dir,
            context_dir,
            slug: slug.to_string(),
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", self.slug))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("meta.json")
    }

    /// Write `meta.json` atomically: write to a sibling temp file, then
    /// rename (spec §9 "atomic file writes").
    pub async fn write_meta(&self, meta: &RunMeta) -> EngineResult<()> {
        let serialized = serde_json::to_vec_pretty(meta).map_err(EngineError::Serialization)?;
        let path = self.meta_path();
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Initial meta at run start; `status` is `"running"`.
    pub fn initial_meta(&self, task: &str, piece: &str) -> RunMeta {
        RunMeta {
            task: task.to_string(),
            piece: piece.to_string(),
            status: "running".to_string(),
            start_time: Utc::now(),
            logs_directory: self.logs_dir.to_string_lossy().into_owned(),
            report_directory: self.report_dir.to_string_lossy().into_owned(),
            run_slug: self.slug.clone(),
        }
    }
}

/// An `EventSink` that appends NDJSON lines to a run's log file and
/// broadcasts each record to live subscribers. One writer per run directory
/// (spec §5: "run logs are append-only, one writer per line").
pub struct SessionLog {
    file: Mutex<tokio::fs::File>,
    sender: broadcast::Sender<serde_json::Value>,
}

impl SessionLog {
    /// Open (creating if necessary) the NDJSON log file at `path` for
    /// appending.
    pub async fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (sender, _) = broadcast::channel(256);
        Ok(Self {
            file: Mutex::new(file),
            sender,
        })
    }

    /// Subscribe to a live feed of every record appended from now on.
    /// Persistent subscribers keep the receiver; one-shot callers can drop
    /// it after the first `recv()`.
    pub fn subscribe(&self) -> broadcast::Receiver<serde_json::Value> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for SessionLog {
    async fn record(&self, record: serde_json::Value) -> EngineResult<()> {
        let mut line = serde_json::to_string(&record).map_err(EngineError::Serialization)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        // No subscribers is not an error; the log file is the durable record.
        let _ = self.sender.send(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn run_directory_creates_expected_tree() {
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "demo-slug").await.unwrap();
        assert!(run.logs_dir.is_dir());
        assert!(run.report_dir.is_dir());
        assert!(run.context_dir.is_dir());
        assert!(run.context_dir.ends_with("context/previous_responses"));
    }

    #[tokio::test]
    async fn write_meta_is_atomic_and_readable() {
        let dir = tempdir().unwrap();
        let run = RunDirectory::create(dir.path(), "demo-slug").await.unwrap();
        let meta = run.initial_meta("fix the bug", "demo");
        run.write_meta(&meta).await.unwrap();

        let raw = tokio::fs::read_to_string(run.meta_path()).await.unwrap();
        let parsed: RunMeta = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.run_slug, "demo-slug");
        assert_eq!(parsed.status, "running");
        assert!(!dir.path().join("meta.json.tmp").exists());
    }

    #[tokio::test]
    async fn session_log_appends_ndjson_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("run.jsonl");
        let log = SessionLog::open(&path).await.unwrap();

        log.record(json!({"type": "piece_start", "piece": "demo"}))
            .await
            .unwrap();
        log.record(json!({"type": "piece_complete", "status": "completed"}))
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "piece_start");
    }

    #[tokio::test]
    async fn subscribers_receive_broadcast_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let log = SessionLog::open(&path).await.unwrap();
        let mut rx = log.subscribe();

        log.record(json!({"type": "movement_start", "movement": "plan"}))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received["movement"], "plan");
    }
}
