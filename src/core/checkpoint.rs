//! Orchestration checkpoints.
//!
//! A checkpoint is a named snapshot of a run's progress (`{run_id}:{stage}`).
//! The file store keeps one append-only JSONL log per run; a later checkpoint
//! for the same stage supersedes earlier ones on load.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;

use crate::domain::TopologyKind;

/// Snapshot of orchestration progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `{run_id}:{stage}`
    pub id: String,
    pub run_id: String,
    pub stage: String,
    pub timestamp: DateTime<Utc>,
    pub topology: TopologyKind,
    pub decision_count: usize,
    pub evidence_count: usize,
    /// Completed agents plus stage-specific extras
    #[serde(default)]
    pub data: Value,
}

impl Checkpoint {
    pub fn new(run_id: &str, stage: &str, topology: TopologyKind) -> Self {
        Self {
            id: format!("{}:{}", run_id, stage),
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            timestamp: Utc::now(),
            topology,
            decision_count: 0,
            evidence_count: 0,
            data: Value::Null,
        }
    }

    pub fn with_counts(mut self, decisions: usize, evidence: usize) -> Self {
        self.decision_count = decisions;
        self.evidence_count = evidence;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Latest checkpoint for `stage`, if any
    async fn load(&self, run_id: &str, stage: &str) -> Result<Option<Checkpoint>>;

    /// Every checkpoint of a run in save order
    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>>;
}

/// JSONL checkpoint log per run under a directory
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open checkpoint log: {}", path.display()))?;

    file.lock_exclusive()
        .context("Failed to acquire file lock on checkpoint log")?;
    writeln!(file, "{}", line).context("Failed to write checkpoint")?;
    file.flush().context("Failed to flush checkpoint")?;

    // Lock is released when file is dropped
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create checkpoint directory: {}", self.dir.display()))?;

        let path = self.log_path(&checkpoint.run_id);
        let line = serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;

        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .context("Checkpoint writer panicked")?
    }

    async fn load(&self, run_id: &str, stage: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .list(run_id)
            .await?
            .into_iter()
            .rev()
            .find(|c| c.stage == stage))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let path = self.log_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open checkpoint log: {}", path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut checkpoints = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let checkpoint: Checkpoint = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse checkpoint: {}", line))?;
            checkpoints.push(checkpoint);
        }
        Ok(checkpoints)
    }
}

/// Checkpoints kept in process memory
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.runs
            .write()
            .await
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str, stage: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .and_then(|log| log.iter().rev().find(|c| c.stage == stage).cloned()))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.runs.read().await.get(run_id).cloned().unwrap_or_default())
    }
}
