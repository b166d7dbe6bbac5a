//! Orchestrator Engine Integration Tests
//!
//! Runs every topology against stub and scripted agents and checks the
//! plan, ledger, events and checkpoints each one leaves behind.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use runbook::adapters::{Agent, AgentProfile, AgentRequest, StubAgent};
use common::FullDisk;
use runbook::core::{
    Checkpoint, CheckpointStore, EventBus, FileCheckpointStore, MemoryStore, Orchestrator,
    OrchestratorOptions, RetryPolicy, RunStore,
};
use runbook::domain::{
    AllocationSource, DecisionType, EventKind, Mandate, PlanStatus, RiskTier, Run, RunKind,
    RunResult, RunStatus, TaskStatus, TopologyKind,
};
use runbook::{Invoker, OrchestratorEngine};
use serde_json::json;
use tempfile::TempDir;

fn orchestrator_with(agent: Arc<dyn Agent>, checkpoints: Option<Arc<dyn CheckpointStore>>) -> Orchestrator {
    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(store.clone()));
    let invoker = Arc::new(Invoker::new(agent, RetryPolicy::immediate(2)));
    Orchestrator::new(
        store,
        bus,
        invoker,
        OrchestratorOptions {
            checkpoints,
            ..Default::default()
        },
    )
}

/// Checkpoint backend that rejects every write
struct ReadOnlyCheckpoints;

#[async_trait]
impl CheckpointStore for ReadOnlyCheckpoints {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        anyhow::bail!("read-only filesystem: {}", checkpoint.id)
    }

    async fn load(&self, _run_id: &str, _stage: &str) -> Result<Option<Checkpoint>> {
        Ok(None)
    }

    async fn list(&self, _run_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(Vec::new())
    }
}

fn stub() -> Orchestrator {
    orchestrator_with(Arc::new(StubAgent::instant()), None)
}

/// Stub replies, recording every request
struct Recording {
    inner: StubAgent,
    requests: Mutex<Vec<(String, AgentRequest)>>,
}

#[async_trait]
impl Agent for Recording {
    fn name(&self) -> &str {
        "recording"
    }

    async fn invoke(&self, agent: &str, request: &AgentRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap()
            .push((agent.to_string(), request.clone()));
        self.inner.invoke(agent, request).await
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        self.inner.describe(agent).await
    }
}

/// Specialists that never propose an allocation
struct NoAllocation;

#[async_trait]
impl Agent for NoAllocation {
    fn name(&self) -> &str {
        "no-allocation"
    }

    async fn invoke(&self, agent: &str, _request: &AgentRequest) -> Result<String> {
        Ok(json!({ "agent": agent, "summary": "nothing to add", "confidence": 0.6 }).to_string())
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        Ok(AgentProfile {
            name: agent.to_string(),
            ..Default::default()
        })
    }
}

/// Stub replies except for one agent that is down
struct OneDown {
    down: &'static str,
}

#[async_trait]
impl Agent for OneDown {
    fn name(&self) -> &str {
        "one-down"
    }

    async fn invoke(&self, agent: &str, request: &AgentRequest) -> Result<String> {
        if agent == self.down {
            anyhow::bail!("{} timed out", agent);
        }
        StubAgent::instant().invoke(agent, request).await
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        StubAgent::instant().describe(agent).await
    }
}

#[tokio::test]
async fn test_every_topology_commits() {
    let orch = stub();

    for kind in TopologyKind::ALL {
        let (run_id, outcome) = orch
            .execute_orchestration(Some(kind.as_str()), Mandate::default())
            .await
            .unwrap_or_else(|e| panic!("{} failed: {:#}", kind, e));

        assert_eq!(outcome.plan.topology, kind);
        assert_eq!(outcome.plan.status, PlanStatus::Completed);
        assert!(outcome.plan.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(outcome.result.source, AllocationSource::Agent, "{}", kind);
        assert!((outcome.result.total_weight() - 1.0).abs() < 1e-9);

        let decisions = outcome.ledger.decisions();
        assert_eq!(decisions.first().unwrap().kind, DecisionType::WorkflowSelection);
        assert_eq!(decisions.last().unwrap().kind, DecisionType::Commit);
        assert_eq!(
            outcome.ledger.decisions_of(DecisionType::AgentCompleted).len(),
            outcome.plan.tasks.len()
        );

        let events = orch.events(&run_id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::Final);
        assert_eq!(events.last().unwrap().payload["decision"], "COMMIT");

        let run = orch.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.decision.as_deref(), Some("COMMIT"));
    }
}

#[tokio::test]
async fn test_fan_in_waits_for_both_specialists() {
    let (_, outcome) = stub()
        .execute_orchestration(Some("concurrent"), Mandate::default())
        .await
        .unwrap();

    let decisions = outcome.ledger.decisions();
    let position = |kind: DecisionType, agent: &str| {
        decisions
            .iter()
            .position(|d| d.kind == kind && d.agent.as_deref() == Some(agent))
            .unwrap()
    };
    let aggregation_started = position(DecisionType::ExecutorInvoked, "portfolio_optimizer");
    assert!(position(DecisionType::AgentCompleted, "risk_analyst") < aggregation_started);
    assert!(position(DecisionType::AgentCompleted, "return_analyst") < aggregation_started);

    let evidence: Vec<&str> = outcome.ledger.all().iter().map(|e| e.agent.as_str()).collect();
    assert_eq!(evidence.len(), 3);
    assert_eq!(evidence[2], "portfolio_optimizer");

    let optimizer = outcome
        .plan
        .tasks
        .iter()
        .find(|t| t.agent == "portfolio_optimizer")
        .unwrap();
    for dep in &optimizer.depends_on {
        let dep = outcome.plan.task(dep).unwrap();
        assert!(dep.completed_at.unwrap() <= optimizer.started_at.unwrap());
    }
}

#[tokio::test]
async fn test_requests_carry_evidence_and_dependency_outputs() {
    let agent = Arc::new(Recording {
        inner: StubAgent::instant(),
        requests: Mutex::new(Vec::new()),
    });
    let orch = orchestrator_with(agent.clone(), None);
    orch.execute_orchestration(Some("dag"), Mandate::default())
        .await
        .unwrap();

    let requests = agent.requests.lock().unwrap();
    let (_, first) = &requests[0];
    assert!(!first.message.contains("Previous Analysis Evidence"));

    let (_, optimizer) = requests
        .iter()
        .find(|(name, _)| name == "portfolio_optimizer")
        .unwrap();
    assert!(optimizer.message.contains("Previous Analysis Evidence"));
    assert!(optimizer.context["dependencies"]["risk_analyst"].is_object());
    assert!(optimizer.context["dependencies"]["return_analyst"].is_object());
    assert_eq!(optimizer.context["mandate"]["risk_tier"], "moderate");
    assert!(optimizer.instructions.is_some());
}

#[tokio::test]
async fn test_handoff_visits_each_specialist_once() {
    let (_, outcome) = stub()
        .execute_orchestration(Some("handoff"), Mandate::default())
        .await
        .unwrap();

    let handoffs: Vec<&str> = outcome
        .ledger
        .decisions_of(DecisionType::Handoff)
        .iter()
        .map(|d| d.action.as_str())
        .collect();
    assert_eq!(
        handoffs,
        vec![
            "market_analyst",
            "risk_analyst",
            "return_analyst",
            "portfolio_optimizer",
            "compliance_officer"
        ]
    );

    // Five delegations plus the final "done" turn
    let coordinator_turns = outcome
        .plan
        .tasks
        .iter()
        .filter(|t| t.agent == "coordinator")
        .count();
    assert_eq!(coordinator_turns, 6);
}

#[tokio::test]
async fn test_magentic_replans_between_rounds() {
    let mandate = Mandate {
        esg_focus: true,
        ..Default::default()
    };
    let (_, outcome) = stub()
        .execute_orchestration(Some("magentic"), mandate)
        .await
        .unwrap();

    let replans = outcome.ledger.decisions_of(DecisionType::Replan);
    assert_eq!(replans.len(), 2);
    assert!(replans[0].action.contains("market_analyst"));
    assert!(replans[1].action.contains("portfolio_optimizer"));
    assert_eq!(outcome.plan.tasks.iter().filter(|t| t.agent == "manager").count(), 3);
}

#[tokio::test]
async fn test_group_chat_stops_at_consensus() {
    let orch = stub();
    let (run_id, outcome) = orch
        .execute_orchestration(Some("group-chat"), Mandate::default())
        .await
        .unwrap();

    assert_eq!(outcome.plan.tasks.len(), 4);
    let events = orch.events(&run_id, 0).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.step == "consensus" && e.payload["message"] == "Consensus reached after 4 turns"));
}

#[tokio::test]
async fn test_unknown_topology_falls_back_to_handoff() {
    let (_, outcome) = stub()
        .execute_orchestration(Some("star"), Mandate::default())
        .await
        .unwrap();
    assert_eq!(outcome.plan.topology, TopologyKind::Handoff);
}

#[tokio::test]
async fn test_default_allocation_by_risk_tier() {
    let orch = orchestrator_with(Arc::new(NoAllocation), None);
    let mandate = Mandate {
        risk_tier: RiskTier::Conservative,
        ..Default::default()
    };
    let (_, outcome) = orch
        .execute_orchestration(Some("sequential"), mandate)
        .await
        .unwrap();

    assert_eq!(outcome.result.source, AllocationSource::Default);
    assert_eq!(outcome.result.allocations["BND"], 0.40);
    assert_eq!(outcome.result.allocations["VTI"], 0.25);
    assert_eq!(outcome.result.metrics.expected_return, 5.5);
    assert_eq!(outcome.result.metrics.sharpe_ratio, 0.44);
}

#[tokio::test]
async fn test_agent_failure_fails_plan() {
    let orch = orchestrator_with(Arc::new(OneDown { down: "risk_analyst" }), None);
    let run_id = orch
        .start_orchestration(Some("sequential"), Mandate::default())
        .await
        .unwrap();

    let events = orch.subscribe(&run_id, Some(0)).await.unwrap().collect().await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.payload["recoverable"], false);
    assert!(events.iter().all(|e| e.kind != EventKind::Final));
    // The chain stopped at the failed task
    assert!(!events
        .iter()
        .any(|e| e.agent.as_deref() == Some("return_analyst")));

    match orch.get_result(&run_id).await.unwrap() {
        RunResult::Failed(error) => assert!(error.contains("risk_analyst"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_checkpoints_written_per_stage() {
    let dir = TempDir::new().unwrap();
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(FileCheckpointStore::new(dir.path().join("checkpoints")));
    let orch = orchestrator_with(Arc::new(StubAgent::instant()), Some(checkpoints.clone()));

    let (run_id, outcome) = orch
        .execute_orchestration(Some("dag"), Mandate::default())
        .await
        .unwrap();

    let stages: Vec<String> = orch
        .checkpoints(&run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.stage)
        .collect();
    assert_eq!(stages.first().map(String::as_str), Some("workflow_started"));
    assert_eq!(stages.last().map(String::as_str), Some("workflow_completed"));
    for agent in ["market_analyst", "risk_analyst", "return_analyst", "portfolio_optimizer", "compliance_officer"] {
        assert!(stages.contains(&format!("agent_completed_{}", agent)), "{:?}", stages);
    }
    assert!(stages.contains(&"workflow_output".to_string()));

    let completed = checkpoints
        .load(&run_id, "workflow_completed")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.id, format!("{}:workflow_completed", run_id));
    assert_eq!(completed.data["total_agents"], 5);
    assert_eq!(completed.evidence_count, outcome.ledger.evidence_count());
    assert!(dir.path().join("checkpoints").join(format!("{}.jsonl", run_id)).exists());
}

#[tokio::test]
async fn test_checkpoint_failures_do_not_abort_run() {
    let orch = orchestrator_with(
        Arc::new(StubAgent::instant()),
        Some(Arc::new(ReadOnlyCheckpoints)),
    );

    let (run_id, outcome) = orch
        .execute_orchestration(Some("sequential"), Mandate::default())
        .await
        .unwrap();
    assert_eq!(outcome.plan.status, PlanStatus::Completed);
    assert_eq!(outcome.ledger.decisions().last().unwrap().kind, DecisionType::Commit);

    let run = orch.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.decision.as_deref(), Some("COMMIT"));
}

#[tokio::test]
async fn test_run_timestamps_cover_each_milestone() {
    let orch = stub();
    let (run_id, outcome) = orch
        .execute_orchestration(Some("concurrent"), Mandate::default())
        .await
        .unwrap();

    let run = orch.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.timestamps, outcome.timestamps);
    for milestone in ["workflow_started", "workflow_completed", "agent_completed_market_analyst"] {
        assert!(run.timestamps.contains_key(milestone), "{:?}", run.timestamps.keys());
    }
    assert!(run.timestamps["workflow_started"] <= run.timestamps["workflow_completed"]);
}

#[tokio::test]
async fn test_result_write_failure_fails_run() {
    let store: Arc<dyn RunStore> = Arc::new(FullDisk::default());
    let bus = Arc::new(EventBus::new(store.clone()));
    let invoker = Arc::new(Invoker::new(Arc::new(StubAgent::instant()), RetryPolicy::immediate(1)));
    let orch = Orchestrator::new(store, bus, invoker, OrchestratorOptions::default());

    let run_id = orch
        .start_orchestration(Some("sequential"), Mandate::default())
        .await
        .unwrap();
    let subscription = orch.subscribe(&run_id, Some(0)).await.unwrap();
    let events = tokio::time::timeout(Duration::from_secs(5), subscription.collect())
        .await
        .expect("stream should end once the run fails");

    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert!(last.payload["message"].as_str().unwrap().contains("disk full"), "{}", last.payload);

    let run = orch.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("disk full"));
    assert!(!orch.bus().is_live(&run_id).await);
}

#[tokio::test]
async fn test_malformed_request_fails_run() {
    let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(store.clone()));
    let invoker = Arc::new(Invoker::new(Arc::new(StubAgent::instant()), RetryPolicy::immediate(1)));
    let engine = OrchestratorEngine::new(invoker, bus.clone(), store.clone());

    let run = Run::new(RunKind::Orchestration, json!({ "mandate": 5 }));
    store.create_run(&run).await.unwrap();

    let err = engine.execute(&run.id).await.unwrap_err();
    assert!(format!("{:#}", err).contains("not an orchestration request"));

    let loaded = store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Failed);
    assert!(loaded.error.unwrap().contains("not an orchestration request"));

    let events = store.get_events(&run.id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Error);
    assert_eq!(events[0].payload["recoverable"], false);
    assert!(!bus.is_live(&run.id).await);
}
