//! Compliance Pipeline Integration Tests
//!
//! Drives complete screening runs through the public API with the stub
//! backend and with scripted agents that misbehave.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use common::FullDisk;
use runbook::adapters::{Agent, AgentProfile, AgentRequest, StubAgent};
use runbook::core::{EventBus, MemoryStore, Orchestrator, OrchestratorOptions, RetryPolicy, RunStore};
use runbook::domain::{EventKind, FinalDecision, PaymentRequest, RunResult, RunStatus, SanctionsDecision};
use runbook::Invoker;
use tokio_test::assert_ok;

fn orchestrator_with(agent: Arc<dyn Agent>) -> Orchestrator {
    orchestrator_over(Arc::new(MemoryStore::new()), agent)
}

fn orchestrator_over(store: Arc<dyn RunStore>, agent: Arc<dyn Agent>) -> Orchestrator {
    let bus = Arc::new(EventBus::new(store.clone()));
    let invoker = Arc::new(Invoker::new(agent, RetryPolicy::immediate(3)));
    Orchestrator::new(store, bus, invoker, OrchestratorOptions::default())
}

/// Replies with prose that contains no JSON
struct Rambling {
    calls: AtomicU32,
}

#[async_trait]
impl Agent for Rambling {
    fn name(&self) -> &str {
        "rambling"
    }

    async fn invoke(&self, agent: &str, _request: &AgentRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} thinks this payment looks fine, probably.", agent))
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        Ok(AgentProfile {
            name: agent.to_string(),
            ..Default::default()
        })
    }
}

/// Stub replies, keeping the message each agent was sent
#[derive(Default)]
struct Transcript {
    messages: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Agent for Transcript {
    fn name(&self) -> &str {
        "transcript"
    }

    async fn invoke(&self, agent: &str, request: &AgentRequest) -> Result<String> {
        self.messages
            .lock()
            .unwrap()
            .push((agent.to_string(), request.message.clone()));
        StubAgent::instant().invoke(agent, request).await
    }

    async fn describe(&self, agent: &str) -> Result<AgentProfile> {
        StubAgent::instant().describe(agent).await
    }
}

/// Always fails
struct Down;

#[async_trait]
impl Agent for Down {
    fn name(&self) -> &str {
        "down"
    }

    async fn invoke(&self, _agent: &str, _request: &AgentRequest) -> Result<String> {
        anyhow::bail!("connection refused")
    }

    async fn describe(&self, _agent: &str) -> Result<AgentProfile> {
        anyhow::bail!("connection refused")
    }
}

#[tokio::test]
async fn test_clear_beneficiary_runs_every_stage() {
    let orch = orchestrator_with(Arc::new(StubAgent::instant()));
    let (run_id, packet) = assert_ok!(
        orch.execute_run(PaymentRequest::new("ACME Trading LLC", 250_000.0))
            .await
    );

    assert!(matches!(packet.decision, FinalDecision::Release | FinalDecision::Hold));
    assert!(!packet.rationale.is_empty());
    assert_eq!(packet.sanctions.decision, SanctionsDecision::Clear);

    let call_ids: HashSet<&str> = [
        "sanctions_tool_run_id",
        "liquidity_tool_run_id",
        "procedures_tool_run_id",
    ]
    .iter()
    .filter_map(|key| packet.audit_note[*key].as_str())
    .collect();
    assert_eq!(call_ids.len(), 3, "audit note: {}", packet.audit_note);

    let events = orch.events(&run_id, 0).await.unwrap();
    assert!(events.iter().all(|e| e.kind != EventKind::StepSkipped));
    for stage in ["intake", "sanctions", "liquidity", "procedures", "summarize"] {
        assert!(
            events.iter().any(|e| e.step == stage && e.kind == EventKind::StepStarted),
            "no step_started for {}",
            stage
        );
    }
    assert_eq!(events.last().unwrap().kind, EventKind::Final);
}

#[tokio::test]
async fn test_sanctions_block_skips_remaining_stages() {
    let orch = orchestrator_with(Arc::new(StubAgent::instant()));
    let (run_id, packet) = orch
        .execute_run(PaymentRequest::new("Bank Maskan Ltd", 50_000.0))
        .await
        .unwrap();

    assert_eq!(packet.decision, FinalDecision::Reject);
    assert_eq!(packet.procedure_checklist[0].step, 1);
    assert_eq!(packet.procedure_checklist[0].action, "REJECT payment immediately");
    assert!(packet.liquidity.is_none());
    assert!(packet.procedures.is_none());
    assert_eq!(packet.audit_note["workflow_terminated_early"], true);

    let evidence = packet.audit_note["evidence"].as_array().unwrap();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0]["type"], "sanctions_screening");
    let decisions = packet.audit_note["decisions"].as_array().unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0]["type"], "branch");
    assert_eq!(decisions[0]["action"], "terminate");

    let events = orch.events(&run_id, 0).await.unwrap();
    let skipped: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::StepSkipped)
        .map(|e| e.step.as_str())
        .collect();
    assert_eq!(skipped, vec!["liquidity", "procedures"]);
    assert!(events
        .iter()
        .filter(|e| e.kind == EventKind::StepSkipped)
        .all(|e| e.payload["reason"] == "SANCTIONS_BLOCK"));
    assert!(!events
        .iter()
        .any(|e| e.kind == EventKind::StepStarted && (e.step == "liquidity" || e.step == "procedures")));
    assert_eq!(events.last().unwrap().kind, EventKind::Final);

    let run = orch.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.decision.as_deref(), Some("REJECT"));
}

#[tokio::test]
async fn test_malformed_replies_never_release() {
    let agent = Arc::new(Rambling {
        calls: AtomicU32::new(0),
    });
    let orch = orchestrator_with(agent.clone());
    let (run_id, packet) = orch
        .execute_run(PaymentRequest::new("ACME Trading LLC", 1_000.0))
        .await
        .unwrap();

    assert_ne!(packet.decision, FinalDecision::Release);
    assert_eq!(packet.sanctions.decision, SanctionsDecision::Escalate);
    assert_eq!(packet.sanctions.match_type, "PARSE_ERROR");
    // Decode failures are not retried
    assert_eq!(agent.calls.load(Ordering::SeqCst), 3);

    let errors = orch
        .events(&run_id, 0)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::Error)
        .count();
    assert_eq!(errors, 3);
    assert!(matches!(orch.get_result(&run_id).await.unwrap(), RunResult::Ready(_)));
}

#[tokio::test]
async fn test_unreachable_service_degrades_to_hold() {
    let orch = orchestrator_with(Arc::new(Down));
    let (run_id, packet) = orch
        .execute_run(PaymentRequest::new("ACME Trading LLC", 1_000.0))
        .await
        .unwrap();

    assert_eq!(packet.decision, FinalDecision::Hold);
    assert_eq!(packet.sanctions.match_type, "ERROR");
    assert!(packet.sanctions.tool_run_id.is_some());

    let fallbacks: Vec<&str> = packet.audit_note["decisions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|d| d["type"] == "fallback")
        .filter_map(|d| d["agent"].as_str())
        .collect();
    assert_eq!(
        fallbacks,
        vec!["sanctions-screening-agent", "liquidity-screening-agent", "operational-procedures-agent"]
    );
    let evidence = packet.audit_note["evidence"].as_array().unwrap();
    assert_eq!(evidence.len(), 3);
    assert!(evidence.iter().all(|e| e["confidence"] == 0.0));

    let run = orch.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_invalid_payment_fails_run() {
    let orch = orchestrator_with(Arc::new(StubAgent::instant()));
    let run_id = orch
        .start_run(PaymentRequest::new("ACME Trading LLC", -5.0))
        .await
        .unwrap();

    let events = orch.subscribe(&run_id, Some(0)).await.unwrap().collect().await;
    assert_eq!(events.last().unwrap().kind, EventKind::Error);

    match orch.get_result(&run_id).await.unwrap() {
        RunResult::Failed(error) => assert!(error.contains("intake"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stage_evidence_reaches_procedures() {
    let agent = Arc::new(Transcript::default());
    let orch = orchestrator_with(agent.clone());
    let (_, packet) = orch
        .execute_run(PaymentRequest::new("ACME Trading LLC", 250_000.0))
        .await
        .unwrap();

    let kinds: Vec<&str> = packet.audit_note["evidence"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert_eq!(
        kinds,
        vec!["sanctions_screening", "liquidity_assessment", "procedures_determination"]
    );
    assert!(packet.audit_note["decisions"].as_array().unwrap().is_empty());

    let messages = agent.messages.lock().unwrap();
    let (_, procedures) = messages
        .iter()
        .find(|(name, _)| name == "operational-procedures-agent")
        .unwrap();
    assert!(procedures.contains("## Previous Analysis Evidence"), "{}", procedures);
    assert!(procedures.contains("[sanctions_screening]"));
    assert!(procedures.contains("[liquidity_assessment]"));
    let (_, sanctions) = messages
        .iter()
        .find(|(name, _)| name == "sanctions-screening-agent")
        .unwrap();
    assert!(!sanctions.contains("Previous Analysis Evidence"));
}

#[tokio::test]
async fn test_decision_write_failure_fails_run() {
    let orch = orchestrator_over(Arc::new(FullDisk::default()), Arc::new(StubAgent::instant()));
    let run_id = orch
        .start_run(PaymentRequest::new("ACME Trading LLC", 1_000.0))
        .await
        .unwrap();

    let events = orch.subscribe(&run_id, Some(0)).await.unwrap().collect().await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert_eq!(last.payload["recoverable"], false);

    match orch.get_result(&run_id).await.unwrap() {
        RunResult::Failed(error) => assert!(error.contains("disk full"), "{}", error),
        other => panic!("expected failure, got {:?}", other),
    }
    let run = orch.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.decision.is_none());
}
