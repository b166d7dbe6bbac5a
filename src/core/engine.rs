//! Generalized orchestrator engine.
//!
//! Drives one orchestration run: selects a topology, lets it build and walk a
//! plan of agent tasks, and records every step three ways: a ledger
//! [`Decision`], a published event and (optionally) a checkpoint. Individual
//! agent calls are retried by the invoker; anything that still fails fails
//! the whole plan.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::event_bus::{publish_lossy, EventBus};
use super::extract::extract_json;
use super::invoker::{Invocation, InvocationError, Invoker};
use super::ledger::{Ledger, DEFAULT_EVIDENCE_WINDOW};
use super::store::RunStore;
use super::topology::{topology_for, Topology};
use crate::adapters::AgentRequest;
use crate::domain::payment::format_amount;
use crate::domain::{
    Decision, DecisionType, EventBody, Evidence, Mandate, Plan, PlanStatus, PortfolioResult,
    RunStatus, Task, TaskStatus, TopologyKind,
};

/// Step name used for plan-level events
const ORCHESTRATOR_STEP: &str = "orchestrator";

/// Decision label stored on a completed orchestration run
pub const COMMIT_DECISION: &str = "COMMIT";

/// Input payload of an orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    /// Topology name; unknown names fall back to handoff
    pub topology: String,
    #[serde(default)]
    pub mandate: Mandate,
}

impl OrchestrationRequest {
    pub fn new(topology: impl Into<String>, mandate: Mandate) -> Self {
        Self {
            topology: topology.into(),
            mandate,
        }
    }

    /// Resolve the topology, falling back to handoff for unknown names
    pub fn topology_kind(&self) -> TopologyKind {
        TopologyKind::from_name(&self.topology).unwrap_or_else(|| {
            warn!(topology = %self.topology, default = "handoff", "Unknown topology, defaulting");
            TopologyKind::Handoff
        })
    }
}

/// Everything a finished orchestration produced
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    pub plan: Plan,
    pub ledger: Ledger,
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    pub result: PortfolioResult,
}

impl OrchestrationOutcome {
    /// Result document persisted on the run
    pub fn document(&self) -> Value {
        json!({
            "plan_id": self.plan.id,
            "topology": self.plan.topology,
            "status": self.plan.status,
            "result": self.result,
            "tasks": self.plan.tasks,
            "decisions": self.ledger.decisions(),
            "evidence": self.ledger.all(),
            "timestamps": self.timestamps,
        })
    }
}

/// The generalized orchestrator engine
pub struct OrchestratorEngine {
    invoker: Arc<Invoker>,
    bus: Arc<EventBus>,
    store: Arc<dyn RunStore>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    evidence_window: usize,
}

impl OrchestratorEngine {
    pub fn new(invoker: Arc<Invoker>, bus: Arc<EventBus>, store: Arc<dyn RunStore>) -> Self {
        Self {
            invoker,
            bus,
            store,
            checkpoints: None,
            evidence_window: DEFAULT_EVIDENCE_WINDOW,
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_evidence_window(mut self, window: usize) -> Self {
        self.evidence_window = window;
        self
    }

    /// Execute a created orchestration run to completion.
    ///
    /// Any error leaves the run failed with an error event and a closed
    /// stream, wherever it happened.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn execute(&self, run_id: &str) -> Result<OrchestrationOutcome> {
        match self.drive(run_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(run_id, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, run_id: &str) -> Result<OrchestrationOutcome> {
        self.bus.start(run_id).await?;
        self.store
            .update_status(run_id, RunStatus::Running, None)
            .await?;

        let run = self
            .store
            .get_run(run_id)
            .await?
            .with_context(|| format!("Run not found: {}", run_id))?;
        let request: OrchestrationRequest = serde_json::from_value(run.request)
            .context("Run request is not an orchestration request")?;

        let topology = topology_for(request.topology_kind());
        let mut plan = Plan::new(run_id, topology.kind(), request.mandate);
        topology.build_plan(&mut plan);

        info!(
            run_id,
            topology = %plan.topology,
            policy_id = %plan.mandate.policy_id,
            tasks = plan.tasks.len(),
            "Orchestration started"
        );

        let mut exec = Execution {
            engine: self,
            plan,
            ledger: Ledger::new(),
            extras: HashMap::new(),
            outputs: Vec::new(),
            timestamps: BTreeMap::new(),
        };

        let result = match exec.run(topology).await {
            Ok(result) => result,
            Err(e) => {
                exec.abandon(&e);
                return Err(e);
            }
        };

        let outcome = OrchestrationOutcome {
            plan: exec.plan,
            ledger: exec.ledger,
            timestamps: exec.timestamps,
            result,
        };
        self.finish(run_id, &outcome).await?;
        Ok(outcome)
    }

    /// Publish the final event, then persist the result. A run is only
    /// completed once its final event is on the stream.
    async fn finish(&self, run_id: &str, outcome: &OrchestrationOutcome) -> Result<()> {
        let document = outcome.document();
        let summary = format!(
            "Committed {} holdings via {} ({} decisions, {} evidence)",
            outcome.result.allocations.len(),
            outcome.plan.topology,
            outcome.ledger.decision_count(),
            outcome.ledger.evidence_count()
        );
        self.bus
            .publish(
                run_id,
                ORCHESTRATOR_STEP,
                None,
                EventBody::final_outcome(COMMIT_DECISION, summary, document.clone()),
            )
            .await?;

        let saved = self
            .store
            .save_decision(run_id, COMMIT_DECISION, &document, &outcome.timestamps)
            .await?;
        if !saved {
            warn!(run_id, "Run already terminal, result not saved");
        }
        self.bus.end(run_id).await;

        info!(
            run_id,
            decisions = outcome.ledger.decision_count(),
            evidence = outcome.ledger.evidence_count(),
            "Orchestration completed"
        );
        Ok(())
    }

    /// Leave the run failed: error event, status with message, closed stream
    async fn fail(&self, run_id: &str, e: &anyhow::Error) {
        let message = format!("{:#}", e);
        error!(run_id, error = %message, "Orchestration failed");

        publish_lossy(
            &self.bus,
            run_id,
            ORCHESTRATOR_STEP,
            Some(ORCHESTRATOR_STEP),
            EventBody::error(message.clone(), false),
        )
        .await;
        if let Err(store_err) = self
            .store
            .update_status(run_id, RunStatus::Failed, Some(&message))
            .await
        {
            warn!(run_id, error = %store_err, "Failed to mark run failed");
        }
        self.bus.end(run_id).await;
    }
}

/// State of one orchestration run, owned by the driving flow.
///
/// Topologies walk the plan through this type; it owns the ledger so no
/// locking is needed, and concurrent agent calls report back to it.
pub struct Execution<'a> {
    engine: &'a OrchestratorEngine,
    plan: Plan,
    ledger: Ledger,
    /// Extra request context per task id
    extras: HashMap<String, Value>,
    /// Decoded outputs in completion order
    outputs: Vec<(String, Value)>,
    /// Milestone -> instant, persisted on the run
    timestamps: BTreeMap<String, DateTime<Utc>>,
}

impl<'a> Execution<'a> {
    async fn run(&mut self, topology: &dyn Topology) -> Result<PortfolioResult> {
        self.plan.status = PlanStatus::Running;

        let kind = self.plan.topology;
        self.record(
            Decision::new(
                DecisionType::WorkflowSelection,
                format!(
                    "Selected {} workflow based on policy complexity and requirements",
                    kind
                ),
                0.95,
                kind.as_str(),
            )
            .with_inputs(&["policy_constraints", "risk_appetite", "preferences"]),
        );
        self.emit(
            ORCHESTRATOR_STEP,
            None,
            EventBody::step_started(format!("Running {} workflow", kind)),
        )
        .await?;
        self.emit(
            ORCHESTRATOR_STEP,
            None,
            EventBody::thinking(
                topology.describe(&self.plan.mandate),
                json!({
                    "topology": kind,
                    "policy_id": self.plan.mandate.policy_id,
                    "risk_tier": self.plan.mandate.risk_tier,
                    "planned_tasks": self.plan.tasks.len(),
                }),
            ),
        )
        .await?;

        self.record(Decision::new(
            DecisionType::WorkflowStarted,
            "Workflow execution initiated",
            1.0,
            "start",
        ));
        self.mark("workflow_started");
        self.checkpoint(
            "workflow_started",
            json!({ "planned_tasks": self.plan.tasks.len() }),
        )
        .await;

        topology.drive(self).await?;

        let result = match self.workflow_output() {
            Some(result) => {
                self.checkpoint("workflow_output", json!({ "has_output": true }))
                    .await;
                result
            }
            None => {
                info!(
                    run_id = %self.plan.run_id,
                    risk_tier = self.plan.mandate.risk_tier.as_str(),
                    "No allocation in agent outputs, using risk-tier default"
                );
                PortfolioResult::default_for(self.plan.mandate.risk_tier)
            }
        };

        self.plan.status = PlanStatus::Completed;
        self.plan.completed_at = Some(Utc::now());
        self.plan.result = Some(result.clone());

        self.record(
            Decision::new(
                DecisionType::Commit,
                "All workflow steps completed successfully, committing final portfolio",
                0.95,
                "commit",
            )
            .with_inputs(&["all_agent_evidence", "workflow_outputs"]),
        );
        self.mark("workflow_completed");
        self.checkpoint(
            "workflow_completed",
            json!({
                "allocations": result.allocations,
                "metrics": result.metrics,
                "total_agents": self.plan.completed_agents().len(),
            }),
        )
        .await;

        Ok(result)
    }

    /// Close out the plan after an error; the engine fails the run
    fn abandon(&mut self, e: &anyhow::Error) {
        self.plan.status = PlanStatus::Failed;
        self.plan.completed_at = Some(Utc::now());
        self.record(Decision::new(
            DecisionType::Failure,
            format!("Workflow execution failed: {:#}", e),
            1.0,
            "error",
        ));
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn mandate(&self) -> &Mandate {
        &self.plan.mandate
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn mark(&mut self, milestone: &str) {
        self.timestamps.insert(milestone.to_string(), Utc::now());
    }

    pub fn record(&mut self, decision: Decision) {
        debug!(
            run_id = %self.plan.run_id,
            decision_type = ?decision.kind,
            decision_number = self.ledger.decision_count() + 1,
            "Orchestrator decision"
        );
        self.ledger.record(decision);
    }

    pub async fn emit(&self, step: &str, agent: Option<&str>, body: EventBody) -> Result<()> {
        self.engine
            .bus
            .publish(&self.plan.run_id, step, agent, body)
            .await?;
        Ok(())
    }

    /// Save a checkpoint; failures are logged and otherwise ignored
    async fn checkpoint(&self, stage: &str, data: Value) {
        let Some(store) = &self.engine.checkpoints else {
            return;
        };

        let checkpoint = Checkpoint::new(&self.plan.run_id, stage, self.plan.topology)
            .with_counts(self.ledger.decision_count(), self.ledger.evidence_count())
            .with_data(data);
        match store.save(&checkpoint).await {
            Ok(()) => debug!(checkpoint_id = %checkpoint.id, "Checkpoint saved"),
            Err(e) => warn!(checkpoint_id = %checkpoint.id, error = %e, "Failed to save checkpoint"),
        }
    }

    /// Append a task to the plan; `extra` is merged into its request context
    pub fn add_task(&mut self, task: Task, extra: Value) -> String {
        let id = task.id.clone();
        if !extra.is_null() {
            self.extras.insert(id.clone(), extra);
        }
        self.plan.tasks.push(task);
        id
    }

    /// Decoded output of a completed task
    pub fn output_of(&self, task_id: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .rev()
            .find(|(id, _)| id == task_id)
            .map(|(_, v)| v)
    }

    /// Ids of every task currently in the plan
    pub fn task_ids(&self) -> Vec<String> {
        self.plan.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Run one task and return its decoded output
    pub async fn run_task(&mut self, task_id: &str) -> Result<Value> {
        self.run_tasks(&[task_id.to_string()]).await?;
        self.output_of(task_id)
            .cloned()
            .with_context(|| format!("Task {} produced no output", task_id))
    }

    /// Run a set of tasks respecting their dependencies.
    ///
    /// Every task whose dependencies have completed is dispatched at once;
    /// results are recorded here, one at a time, as they arrive. A task is
    /// only dispatched after its dependencies' evidence is in the ledger.
    pub async fn run_tasks(&mut self, task_ids: &[String]) -> Result<()> {
        let mut pending: Vec<String> = task_ids.to_vec();
        let mut in_flight: JoinSet<(String, Result<Invocation, InvocationError>)> = JoinSet::new();

        loop {
            let mut ready: Vec<String> = pending
                .iter()
                .filter(|id| self.dependencies_met(id))
                .cloned()
                .collect();
            pending.retain(|id| !ready.contains(id));
            ready.sort_by_key(|id| std::cmp::Reverse(self.plan.task(id).map_or(0, |t| t.priority)));

            for id in ready {
                let (agent, request) = self.start_task(&id).await?;
                let invoker = self.engine.invoker.clone();
                in_flight.spawn(async move {
                    let result = invoker.invoke(&agent, request).await;
                    (id, result)
                });
            }

            match in_flight.join_next().await {
                Some(joined) => {
                    let (id, result) = joined.context("Agent task panicked")?;
                    match result {
                        Ok(invocation) => self.complete_task(&id, invocation).await?,
                        Err(e) => {
                            self.fail_task(&id, &e);
                            return Err(e.into());
                        }
                    }
                }
                None if pending.is_empty() => return Ok(()),
                None => {
                    for id in &pending {
                        if let Some(task) = self.plan.task_mut(id) {
                            task.status = TaskStatus::Blocked;
                        }
                    }
                    anyhow::bail!(
                        "Plan cannot make progress, tasks blocked on unmet or cyclic dependencies: {}",
                        pending.join(", ")
                    );
                }
            }
        }
    }

    fn dependencies_met(&self, task_id: &str) -> bool {
        self.plan.task(task_id).map_or(false, |task| {
            task.depends_on.iter().all(|dep| {
                self.plan
                    .task(dep)
                    .map_or(false, |d| d.status == TaskStatus::Completed)
            })
        })
    }

    /// Mark a task running and build its agent request
    async fn start_task(&mut self, task_id: &str) -> Result<(String, AgentRequest)> {
        let request = self.request_for(task_id)?;
        let task = self
            .plan
            .task_mut(task_id)
            .with_context(|| format!("Unknown task {}", task_id))?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        let agent = task.agent.clone();
        let step = task.kind.as_str();

        self.ledger.record(
            Decision::new(
                DecisionType::ExecutorInvoked,
                format!("Invoking executor: {}", agent),
                0.9,
                task_id,
            )
            .with_inputs(&["workflow_state", "pending_tasks"])
            .with_agent(&agent),
        );
        self.emit(
            step,
            Some(&agent),
            EventBody::step_started(format!("{} running {}", agent, step)),
        )
        .await?;
        Ok((agent, request))
    }

    fn request_for(&self, task_id: &str) -> Result<AgentRequest> {
        let task = self
            .plan
            .task(task_id)
            .with_context(|| format!("Unknown task {}", task_id))?;
        let mandate = &self.plan.mandate;

        let mut message = format!(
            "## Portfolio task: {}\n\n\
             - Policy ID: {}\n\
             - Risk tier: {}\n\
             - Portfolio value: ${}\n\
             - ESG focus: {}",
            task.kind.as_str(),
            mandate.policy_id,
            mandate.risk_tier.as_str(),
            format_amount(mandate.portfolio_value),
            mandate.esg_focus
        );
        if !mandate.constraints.is_empty() {
            message.push_str(&format!("\n- Constraints: {}", mandate.constraints.join("; ")));
        }
        if let Some(block) = self.ledger.context_block(self.engine.evidence_window) {
            message.push_str("\n\n");
            message.push_str(&block);
        }

        let dependencies: Map<String, Value> = task
            .depends_on
            .iter()
            .filter_map(|dep| {
                let agent = self.plan.task(dep)?.agent.clone();
                Some((agent, self.output_of(dep)?.clone()))
            })
            .collect();

        let mut context = Map::new();
        context.insert("task".to_string(), json!(task.kind));
        context.insert("mandate".to_string(), json!(mandate));
        context.insert("dependencies".to_string(), Value::Object(dependencies));
        if let Some(Value::Object(extra)) = self.extras.get(task_id) {
            for (k, v) in extra {
                context.insert(k.clone(), v.clone());
            }
        }

        Ok(AgentRequest::new(message).with_context(Value::Object(context)))
    }

    async fn complete_task(&mut self, task_id: &str, invocation: Invocation) -> Result<()> {
        let (output, decoded) = match extract_json(&invocation.text) {
            Ok(value) => (value, true),
            Err(e) => {
                warn!(task_id, call_id = %invocation.call_id, error = %e, "Agent output not structured");
                (json!({ "raw": invocation.text }), false)
            }
        };

        let task = self
            .plan
            .task_mut(task_id)
            .with_context(|| format!("Unknown task {}", task_id))?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result = Some(output.clone());
        let agent = task.agent.clone();
        let kind = task.kind;

        let summary = output
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} completed {}", agent, kind.as_str()));
        let confidence = if decoded {
            output.get("confidence").and_then(Value::as_f64).unwrap_or(0.5)
        } else {
            0.0
        };

        self.ledger.append(
            Evidence::new(&agent, kind.evidence_type(), confidence, &summary).with_data(output.clone()),
        );
        self.ledger.record(
            Decision::new(
                DecisionType::AgentCompleted,
                format!("Agent {} completed {}", agent, kind.as_str()),
                0.9,
                task_id,
            )
            .with_inputs(&["agent_input", "tools_available"])
            .with_agent(&agent),
        );

        self.emit(
            kind.as_str(),
            Some(&agent),
            EventBody::tool_call(
                agent.clone(),
                Some(invocation.call_id.clone()),
                json!({ "task_id": task_id, "attempts": invocation.attempts }),
                Some(summary.clone()),
                Some(invocation.duration_ms),
            ),
        )
        .await?;
        self.emit(
            kind.as_str(),
            Some(&agent),
            EventBody::step_completed(summary, output.clone()),
        )
        .await?;

        self.outputs.push((task_id.to_string(), output));
        info!(run_id = %self.plan.run_id, task_id, agent = %agent, "Agent completed");

        self.mark(&format!("agent_completed_{}", agent));
        let completed = self.plan.completed_agents();
        self.checkpoint(
            &format!("agent_completed_{}", agent),
            json!({ "agent": agent, "completed_agents": completed }),
        )
        .await;
        Ok(())
    }

    fn fail_task(&mut self, task_id: &str, e: &InvocationError) {
        warn!(run_id = %self.plan.run_id, task_id, call_id = e.call_id(), error = %e, "Task failed");
        if let Some(task) = self.plan.task_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
        }
    }

    /// Latest agent output carrying an allocation
    fn workflow_output(&self) -> Option<PortfolioResult> {
        self.outputs
            .iter()
            .rev()
            .find_map(|(_, output)| PortfolioResult::from_output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_topology_falls_back_to_handoff() {
        let request = OrchestrationRequest::new("round-table", Mandate::default());
        assert_eq!(request.topology_kind(), TopologyKind::Handoff);

        let request = OrchestrationRequest::new("Group-Chat", Mandate::default());
        assert_eq!(request.topology_kind(), TopologyKind::GroupChat);
    }

    #[test]
    fn test_request_defaults_mandate() {
        let request: OrchestrationRequest = serde_json::from_value(json!({ "topology": "dag" })).unwrap();
        assert_eq!(request.mandate, Mandate::default());
    }
}
