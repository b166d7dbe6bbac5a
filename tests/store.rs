//! Run Store Integration Tests
//!
//! The same contract checked against the in-memory and SQLite stores,
//! plus persistence across reopening the database file.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use runbook::core::{MemoryStore, RunStore, SqliteStore};
use runbook::domain::{Run, RunFilter, RunKind, RunStatus};
use serde_json::json;
use tempfile::TempDir;

/// Six runs, one minute apart, alternating kinds; returns ids oldest first
async fn seed(store: &dyn RunStore) -> Vec<String> {
    let base = Utc::now() - Duration::hours(1);
    let mut ids = Vec::new();
    for i in 0..6 {
        let kind = if i % 2 == 0 {
            RunKind::Compliance
        } else {
            RunKind::Orchestration
        };
        let mut run = Run::new(kind, json!({ "n": i }));
        run.created_at = base + Duration::minutes(i);
        store.create_run(&run).await.unwrap();
        ids.push(run.id);
    }
    ids
}

async fn check_listing(store: Arc<dyn RunStore>) {
    let ids = seed(store.as_ref()).await;
    store.update_status(&ids[0], RunStatus::Failed, Some("boom")).await.unwrap();
    store
        .save_decision(&ids[3], "COMMIT", &json!({ "ok": true }), &BTreeMap::new())
        .await
        .unwrap();

    let all = store.list_runs(&RunFilter::default()).await.unwrap();
    let newest_first: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
    let mut expected: Vec<&str> = ids.iter().map(String::as_str).collect();
    expected.reverse();
    assert_eq!(newest_first, expected);

    let page = store
        .list_runs(&RunFilter {
            limit: 2,
            offset: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![ids[3].as_str(), ids[2].as_str()]);

    let failed = store
        .list_runs(&RunFilter {
            status: Some(RunStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("boom"));

    let orchestrations = store
        .list_runs(&RunFilter {
            kind: Some(RunKind::Orchestration),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(orchestrations.len(), 3);
    assert!(orchestrations.iter().all(|r| r.kind == RunKind::Orchestration));

    let completed_orchestrations = store
        .list_runs(&RunFilter {
            status: Some(RunStatus::Completed),
            kind: Some(RunKind::Orchestration),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(completed_orchestrations.len(), 1);
    assert_eq!(completed_orchestrations[0].decision.as_deref(), Some("COMMIT"));
}

async fn check_terminal_once(store: Arc<dyn RunStore>) {
    let run = Run::new(RunKind::Compliance, json!({ "beneficiary_name": "ACME" }));
    store.create_run(&run).await.unwrap();

    assert!(store.update_status(&run.id, RunStatus::Running, None).await.unwrap());
    assert!(store
        .update_status(&run.id, RunStatus::Failed, Some("intake: amount must be positive"))
        .await
        .unwrap());

    // Neither a late decision nor a late status overwrites the failure
    assert!(!store
        .save_decision(&run.id, "RELEASE", &json!({}), &BTreeMap::new())
        .await
        .unwrap());
    assert!(!store.update_status(&run.id, RunStatus::Completed, None).await.unwrap());

    let loaded = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Failed);
    assert!(loaded.decision.is_none());
    assert!(loaded.completed_at.is_some());
    assert!(store.get_decision(&run.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_memory_listing() {
    check_listing(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_listing() {
    let dir = TempDir::new().unwrap();
    check_listing(Arc::new(SqliteStore::open(&dir.path().join("runs.db")).unwrap())).await;
}

#[tokio::test]
async fn test_memory_terminal_once() {
    check_terminal_once(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_terminal_once() {
    let dir = TempDir::new().unwrap();
    check_terminal_once(Arc::new(SqliteStore::open(&dir.path().join("runs.db")).unwrap())).await;
}

#[tokio::test]
async fn test_decision_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("runs.db");
    let run = Run::new(RunKind::Compliance, json!({ "beneficiary_name": "ACME", "amount": 250000.0 }));

    let mut timestamps = BTreeMap::new();
    timestamps.insert("sanctions".to_string(), Utc::now());
    timestamps.insert("summarize".to_string(), Utc::now());
    {
        let store = SqliteStore::open(&path).unwrap();
        store.create_run(&run).await.unwrap();
        assert!(store
            .save_decision(&run.id, "HOLD", &json!({ "decision": "HOLD" }), &timestamps)
            .await
            .unwrap());
    }

    let store = SqliteStore::open(&path).unwrap();
    let loaded = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Completed);
    assert_eq!(loaded.decision.as_deref(), Some("HOLD"));
    assert_eq!(loaded.request_digest, run.request_digest);
    assert_eq!(loaded.beneficiary(), Some("ACME"));
    assert_eq!(loaded.timestamps.keys().collect::<Vec<_>>(), vec!["sanctions", "summarize"]);
    assert_eq!(store.get_decision(&run.id).await.unwrap(), Some(json!({ "decision": "HOLD" })));
}
