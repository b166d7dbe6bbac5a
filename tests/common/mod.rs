//! Shared fixtures for the integration tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runbook::core::{MemoryStore, RunStore, StoreError};
use runbook::domain::{Event, Run, RunFilter, RunStatus};
use serde_json::Value;

/// In-memory store whose disk fills up the moment a decision is saved
#[derive(Default)]
pub struct FullDisk {
    inner: MemoryStore,
}

#[async_trait]
impl RunStore for FullDisk {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        self.inner.create_run(run).await
    }

    async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.inner.update_status(run_id, status, error).await
    }

    async fn save_decision(
        &self,
        _run_id: &str,
        _decision: &str,
        _result: &Value,
        _timestamps: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Database("disk full".to_string()))
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        self.inner.list_runs(filter).await
    }

    async fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        self.inner.save_event(event).await
    }

    async fn events_since(&self, run_id: &str, since: u64) -> Result<Vec<Event>, StoreError> {
        self.inner.events_since(run_id, since).await
    }

    async fn next_seq(&self, run_id: &str) -> Result<u64, StoreError> {
        self.inner.next_seq(run_id).await
    }
}
