//! Run control.
//!
//! The [`Orchestrator`] wires the store, event bus, invoker and both engines
//! together. Callers start runs, poll their results and subscribe to their
//! event streams through it; each started run executes on its own tokio task.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, instrument};

use super::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use super::engine::{OrchestrationOutcome, OrchestrationRequest, OrchestratorEngine};
use super::event_bus::{EventBus, Subscription};
use super::invoker::Invoker;
use super::ledger::DEFAULT_EVIDENCE_WINDOW;
use super::pipeline::{ComplianceAgents, CompliancePipeline};
use super::sqlite::SqliteStore;
use super::store::RunStore;
use crate::adapters::{Agent, HttpAgent, StubAgent};
use crate::config::ResolvedConfig;
use crate::domain::{
    DecisionPacket, Event, Mandate, PaymentRequest, Run, RunFilter, RunKind, RunResult,
    RunStatus, TopologyKind,
};

/// Knobs that are not components
#[derive(Clone)]
pub struct OrchestratorOptions {
    pub agents: ComplianceAgents,
    pub checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub evidence_window: usize,
    /// Topology used when a caller names none
    pub default_topology: TopologyKind,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            agents: ComplianceAgents::default(),
            checkpoints: None,
            evidence_window: DEFAULT_EVIDENCE_WINDOW,
            default_topology: TopologyKind::Handoff,
        }
    }
}

/// Run control facade over both engines
pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    pipeline: Arc<CompliancePipeline>,
    engine: Arc<OrchestratorEngine>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    default_topology: TopologyKind,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        invoker: Arc<Invoker>,
        options: OrchestratorOptions,
    ) -> Self {
        let pipeline = CompliancePipeline::new(invoker.clone(), bus.clone(), store.clone())
            .with_agents(options.agents);

        let mut engine = OrchestratorEngine::new(invoker, bus.clone(), store.clone())
            .with_evidence_window(options.evidence_window);
        if let Some(checkpoints) = &options.checkpoints {
            engine = engine.with_checkpoints(checkpoints.clone());
        }

        Self {
            store,
            bus,
            pipeline: Arc::new(pipeline),
            engine: Arc::new(engine),
            checkpoints: options.checkpoints,
            default_topology: options.default_topology,
        }
    }

    /// Build every component from configuration. `force_dry_run` selects the
    /// stub backend even when an endpoint is configured.
    pub fn from_config(config: &ResolvedConfig, force_dry_run: bool) -> Result<Self> {
        let store: Arc<dyn RunStore> = Arc::new(
            SqliteStore::open(&config.database)
                .with_context(|| format!("Failed to open run store: {}", config.database.display()))?,
        );

        let backend: Arc<dyn Agent> = match (&config.agents.endpoint, force_dry_run || config.agents.dry_run) {
            (Some(endpoint), false) => {
                info!(endpoint = %endpoint, "Using hosted agent service");
                Arc::new(HttpAgent::new(endpoint.clone(), config.agents.token.clone()))
            }
            _ => {
                info!(latency_ms = config.agents.stub_latency.as_millis() as u64, "Dry run, using stub agents");
                Arc::new(StubAgent::new(config.agents.stub_latency))
            }
        };
        let invoker = Arc::new(Invoker::new(backend, config.retry.clone()));

        let bus = Arc::new(
            EventBus::new(store.clone())
                .with_heartbeat(config.events.heartbeat)
                .with_redaction(config.events.redact_sensitive),
        );

        let checkpoints: Option<Arc<dyn CheckpointStore>> = if config.orchestrator.checkpointing {
            Some(Arc::new(FileCheckpointStore::new(config.checkpoints_dir())))
        } else {
            None
        };

        Ok(Self::new(
            store,
            bus,
            invoker,
            OrchestratorOptions {
                agents: config.agents.compliance.clone(),
                checkpoints,
                evidence_window: config.orchestrator.evidence_window,
                default_topology: config.orchestrator.default_topology,
            },
        ))
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    async fn create_compliance_run(&self, payment: PaymentRequest) -> Result<String> {
        let request = serde_json::to_value(payment.normalized()).context("Failed to serialize payment")?;
        let run = Run::new(RunKind::Compliance, request);
        self.store.create_run(&run).await?;
        self.bus.start(&run.id).await?;
        info!(run_id = %run.id, digest = %run.request_digest, "Compliance run created");
        Ok(run.id)
    }

    async fn create_orchestration_run(
        &self,
        topology: Option<&str>,
        mandate: Mandate,
    ) -> Result<String> {
        let topology = topology.unwrap_or(self.default_topology.as_str());
        let request = serde_json::to_value(OrchestrationRequest::new(topology, mandate))
            .context("Failed to serialize orchestration request")?;
        let run = Run::new(RunKind::Orchestration, request);
        self.store.create_run(&run).await?;
        self.bus.start(&run.id).await?;
        info!(run_id = %run.id, topology, "Orchestration run created");
        Ok(run.id)
    }

    /// Submit a payment for screening; the run executes in the background
    #[instrument(skip(self, payment), fields(beneficiary = %payment.beneficiary_name))]
    pub async fn start_run(&self, payment: PaymentRequest) -> Result<String> {
        let run_id = self.create_compliance_run(payment).await?;

        let pipeline = self.pipeline.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.execute(&id).await {
                error!(run_id = %id, error = %format!("{:#}", e), "Compliance run failed");
            }
        });
        Ok(run_id)
    }

    /// Screen a payment and wait for the decision
    pub async fn execute_run(&self, payment: PaymentRequest) -> Result<(String, DecisionPacket)> {
        let run_id = self.create_compliance_run(payment).await?;
        let packet = self.pipeline.execute(&run_id).await?;
        Ok((run_id, packet))
    }

    /// Start a portfolio orchestration in the background
    #[instrument(skip(self, mandate), fields(policy_id = %mandate.policy_id))]
    pub async fn start_orchestration(
        &self,
        topology: Option<&str>,
        mandate: Mandate,
    ) -> Result<String> {
        let run_id = self.create_orchestration_run(topology, mandate).await?;

        let engine = self.engine.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.execute(&id).await {
                error!(run_id = %id, error = %format!("{:#}", e), "Orchestration run failed");
            }
        });
        Ok(run_id)
    }

    /// Run a portfolio orchestration and wait for it
    pub async fn execute_orchestration(
        &self,
        topology: Option<&str>,
        mandate: Mandate,
    ) -> Result<(String, OrchestrationOutcome)> {
        let run_id = self.create_orchestration_run(topology, mandate).await?;
        let outcome = self.engine.execute(&run_id).await?;
        Ok((run_id, outcome))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn get_result(&self, run_id: &str) -> Result<RunResult> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(RunResult::NotFound);
        };

        Ok(match run.status {
            RunStatus::Completed => RunResult::Ready(run.result.unwrap_or_default()),
            RunStatus::Failed => {
                RunResult::Failed(run.error.unwrap_or_else(|| "unknown error".to_string()))
            }
            status => RunResult::Pending(status),
        })
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        Ok(self.store.list_runs(filter).await?)
    }

    /// Subscribe to a run's event stream, see [`EventBus::subscribe`]
    pub async fn subscribe(&self, run_id: &str, since: Option<u64>) -> Result<Subscription> {
        Ok(self.bus.subscribe(run_id, since).await?)
    }

    /// Persisted events after `since`
    pub async fn events(&self, run_id: &str, since: u64) -> Result<Vec<Event>> {
        Ok(self.store.events_since(run_id, since).await?)
    }

    /// Checkpoints of an orchestration run (empty when checkpointing is off)
    pub async fn checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        match &self.checkpoints {
            Some(store) => store.list(run_id).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::MemoryCheckpointStore;
    use crate::core::invoker::RetryPolicy;
    use crate::core::store::MemoryStore;
    use crate::domain::Frame;

    fn orchestrator() -> Orchestrator {
        let store: Arc<dyn RunStore> = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(store.clone()));
        let invoker = Arc::new(Invoker::new(Arc::new(StubAgent::instant()), RetryPolicy::immediate(2)));
        Orchestrator::new(
            store,
            bus,
            invoker,
            OrchestratorOptions {
                checkpoints: Some(Arc::new(MemoryCheckpointStore::new())),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let orch = orchestrator();
        assert_eq!(orch.get_result("missing").await.unwrap(), RunResult::NotFound);
        assert!(orch.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_started_run_streams_to_completion() {
        let orch = orchestrator();
        let run_id = orch
            .start_run(PaymentRequest::new("ACME Trading LLC", 250_000.0))
            .await
            .unwrap();

        let mut sub = orch.subscribe(&run_id, Some(0)).await.unwrap();
        let mut seqs = Vec::new();
        let mut last = None;
        while let Some(frame) = sub.next().await {
            if let Frame::Event(event) = frame {
                seqs.push(event.seq);
                last = Some(event);
            }
        }

        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
        assert_eq!(last.unwrap().kind, crate::domain::EventKind::Final);
        assert!(matches!(orch.get_result(&run_id).await.unwrap(), RunResult::Ready(_)));
    }

    #[tokio::test]
    async fn test_orchestration_uses_default_topology() {
        let orch = orchestrator();
        let (run_id, outcome) = orch
            .execute_orchestration(None, Mandate::default())
            .await
            .unwrap();

        assert_eq!(outcome.plan.topology, TopologyKind::Handoff);
        let run = orch.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.kind, RunKind::Orchestration);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!orch.checkpoints(&run_id).await.unwrap().is_empty());
    }
}
