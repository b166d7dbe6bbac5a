//! Run and event persistence.
//!
//! [`RunStore`] is the keyed record interface the engines and the event bus
//! write through. Two implementations ship: [`MemoryStore`] for tests and
//! ephemeral runs, and [`SqliteStore`](super::sqlite::SqliteStore).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::{Event, Run, RunFilter, RunStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run {0} already exists")]
    DuplicateRun(String),

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Event {seq} of run {run_id} already persisted")]
    DuplicateEvent { run_id: String, seq: u64 },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Keyed storage for runs and their events
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Move a run to `status`. Returns `false` (and changes nothing) when the
    /// run is already terminal: terminal status is written exactly once.
    async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Persist the decision and result document and mark the run completed
    async fn save_decision(
        &self,
        run_id: &str,
        decision: &str,
        result: &Value,
        timestamps: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Result document of a completed run
    async fn get_decision(&self, run_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_run(run_id).await?.and_then(|r| r.result))
    }

    /// Newest first
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    /// Persist one event; `(run_id, seq)` is unique
    async fn save_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Persisted events with `seq > since`, in seq order
    async fn events_since(&self, run_id: &str, since: u64) -> Result<Vec<Event>, StoreError>;

    async fn get_events(&self, run_id: &str) -> Result<Vec<Event>, StoreError> {
        self.events_since(run_id, 0).await
    }

    /// One past the highest persisted seq (1 for a fresh run)
    async fn next_seq(&self, run_id: &str) -> Result<u64, StoreError>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<String, Run>>,
    events: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(StoreError::DuplicateRun(run.id.clone()));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Ok(false);
        }

        run.status = status;
        if let Some(error) = error {
            run.error = Some(error.to_string());
        }
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn save_decision(
        &self,
        run_id: &str,
        decision: &str,
        result: &Value,
        timestamps: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Ok(false);
        }

        run.decision = Some(decision.to_string());
        run.result = Some(result.clone());
        run.timestamps = timestamps.clone();
        run.status = RunStatus::Completed;
        run.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read().await;
        let mut matching: Vec<Run> = runs.values().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        let log = events.entry(event.run_id.clone()).or_default();
        if log.iter().any(|e| e.seq == event.seq) {
            return Err(StoreError::DuplicateEvent {
                run_id: event.run_id.clone(),
                seq: event.seq,
            });
        }
        log.push(event.clone());
        log.sort_by_key(|e| e.seq);
        Ok(())
    }

    async fn events_since(&self, run_id: &str, since: u64) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(run_id)
            .map(|log| log.iter().filter(|e| e.seq > since).cloned().collect())
            .unwrap_or_default())
    }

    async fn next_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(run_id)
            .and_then(|log| log.last())
            .map_or(1, |e| e.seq + 1))
    }
}
