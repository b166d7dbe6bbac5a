//! Fixed compliance pipeline.
//!
//! Intake -> Sanctions -> Liquidity -> Procedures -> Summarize, driven as an
//! explicit state machine. A sanctions BLOCK terminates early: the remaining
//! screening stages are skipped and Summarize builds a REJECT packet. Agent
//! failures never fail the run; each stage substitutes a conservative
//! fallback result. Only store or bus failures fail a run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use super::event_bus::{publish_lossy, EventBus};
use super::extract::decode;
use super::invoker::Invoker;
use super::ledger::{Ledger, DEFAULT_EVIDENCE_WINDOW};
use super::store::RunStore;
use crate::adapters::AgentRequest;
use crate::domain::payment::format_amount;
use crate::domain::{
    ApprovalRequired, ChecklistStep, Citation, Decision, DecisionPacket, DecisionType,
    DetailCategory, EventBody, Evidence, FinalDecision, LiquidityResult, PaymentRequest,
    ProceduresResult, RunStatus, SanctionsDecision, SanctionsResult, Severity,
};

/// Amount above which dual approval is required
const DUAL_APPROVAL_THRESHOLD: f64 = 250_000.0;

/// Reason recorded on stages skipped after a hard block
pub const SANCTIONS_BLOCK: &str = "SANCTIONS_BLOCK";

/// Names of the hosted agents backing each screening stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceAgents {
    pub sanctions: String,
    pub liquidity: String,
    pub procedures: String,
}

impl Default for ComplianceAgents {
    fn default() -> Self {
        Self {
            sanctions: "sanctions-screening-agent".to_string(),
            liquidity: "liquidity-screening-agent".to_string(),
            procedures: "operational-procedures-agent".to_string(),
        }
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Intake,
    Sanctions,
    Liquidity,
    Procedures,
    Summarize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Sanctions => "sanctions",
            Self::Liquidity => "liquidity",
            Self::Procedures => "procedures",
            Self::Summarize => "summarize",
        }
    }

    /// Screening stages bypassed when the run terminates after `self`
    fn skipped_after(&self) -> &'static [Stage] {
        match self {
            Self::Intake => &[Self::Sanctions, Self::Liquidity, Self::Procedures],
            Self::Sanctions => &[Self::Liquidity, Self::Procedures],
            Self::Liquidity => &[Self::Procedures],
            Self::Procedures | Self::Summarize => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens after a stage completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Next(Stage),
    /// Skip every remaining screening stage and summarize
    Terminate(&'static str),
}

/// Mutable state of one pipeline run, owned by the driving flow
struct RunState {
    run_id: String,
    payment: PaymentRequest,
    timestamps: BTreeMap<String, DateTime<Utc>>,
    sanctions: Option<SanctionsResult>,
    liquidity: Option<LiquidityResult>,
    procedures: Option<ProceduresResult>,
    terminated: Option<&'static str>,
    /// Stage evidence and branch/fallback decisions
    ledger: Ledger,
}

impl RunState {
    fn mark(&mut self, key: &str) {
        self.timestamps.insert(key.to_string(), Utc::now());
    }
}

/// An agent call that produced no usable result
struct StageFailure {
    call_id: Option<String>,
    message: String,
    parse_error: bool,
}

/// The compliance pipeline engine
pub struct CompliancePipeline {
    invoker: Arc<Invoker>,
    bus: Arc<EventBus>,
    store: Arc<dyn RunStore>,
    agents: ComplianceAgents,
}

impl CompliancePipeline {
    pub fn new(invoker: Arc<Invoker>, bus: Arc<EventBus>, store: Arc<dyn RunStore>) -> Self {
        Self {
            invoker,
            bus,
            store,
            agents: ComplianceAgents::default(),
        }
    }

    pub fn with_agents(mut self, agents: ComplianceAgents) -> Self {
        self.agents = agents;
        self
    }

    pub fn agents(&self) -> &ComplianceAgents {
        &self.agents
    }

    /// Execute a created run to completion.
    ///
    /// On an unexpected error the run is marked failed, an error event is
    /// published, the stream is ended and the error is returned.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn execute(&self, run_id: &str) -> Result<DecisionPacket> {
        match self.drive(run_id).await {
            Ok(packet) => Ok(packet),
            Err(e) => {
                let message = format!("{:#}", e);
                error!(run_id, error = %message, "Workflow failed");

                publish_lossy(
                    &self.bus,
                    run_id,
                    Stage::Summarize.as_str(),
                    Some("orchestrator"),
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
                Err(e)
            }
        }
    }

    async fn drive(&self, run_id: &str) -> Result<DecisionPacket> {
        self.bus.start(run_id).await?;
        self.store
            .update_status(run_id, RunStatus::Running, None)
            .await?;

        let run = self
            .store
            .get_run(run_id)
            .await?
            .with_context(|| format!("Run not found: {}", run_id))?;
        let payment: PaymentRequest =
            serde_json::from_value(run.request).context("Run request is not a payment")?;

        let mut state = RunState {
            run_id: run_id.to_string(),
            payment,
            timestamps: BTreeMap::new(),
            sanctions: None,
            liquidity: None,
            procedures: None,
            terminated: None,
            ledger: Ledger::new(),
        };
        state.mark("workflow_started");

        let mut stage = Stage::Intake;
        loop {
            let transition = match stage {
                Stage::Intake => self.intake(&mut state).await?,
                Stage::Sanctions => self.sanctions(&mut state).await?,
                Stage::Liquidity => self.liquidity(&mut state).await?,
                Stage::Procedures => self.procedures(&mut state).await?,
                Stage::Summarize => return self.summarize(state).await,
            };

            stage = match transition {
                Transition::Next(next) => next,
                Transition::Terminate(reason) => {
                    info!(run_id, stage = %stage, reason, "Workflow terminated early");
                    state.terminated = Some(reason);
                    for skipped in stage.skipped_after() {
                        self.emit(&state, *skipped, None, EventBody::step_skipped(reason))
                            .await?;
                    }
                    Stage::Summarize
                }
            };
        }
    }

    async fn emit(
        &self,
        state: &RunState,
        stage: Stage,
        agent: Option<&str>,
        body: EventBody,
    ) -> Result<()> {
        self.bus
            .publish(&state.run_id, stage.as_str(), agent, body)
            .await?;
        Ok(())
    }

    /// Invoke a stage agent and decode its reply
    async fn call_stage<T: DeserializeOwned>(
        &self,
        agent: &str,
        request: AgentRequest,
        expected: &'static str,
    ) -> std::result::Result<(T, String), StageFailure> {
        let invocation = self
            .invoker
            .invoke(agent, request)
            .await
            .map_err(|e| StageFailure {
                call_id: Some(e.call_id().to_string()),
                message: e.to_string(),
                parse_error: false,
            })?;

        match decode::<T>(&invocation.text, expected) {
            Ok(result) => Ok((result, invocation.call_id)),
            Err(e) => Err(StageFailure {
                call_id: Some(invocation.call_id),
                message: e.to_string(),
                parse_error: true,
            }),
        }
    }

    async fn report_failure(
        &self,
        state: &mut RunState,
        stage: Stage,
        agent: &str,
        failure: &StageFailure,
    ) -> Result<()> {
        state.ledger.record(
            Decision::new(
                DecisionType::Fallback,
                format!("{} agent unavailable, using conservative result: {}", stage, failure.message),
                1.0,
                "fallback",
            )
            .with_inputs(if failure.parse_error { &["agent_reply"] } else { &["agent_call"] })
            .with_agent(agent),
        );
        warn!(
            run_id = %state.run_id,
            step = %stage,
            agent,
            parse_error = failure.parse_error,
            error = %failure.message,
            "Stage degraded to fallback result"
        );
        self.emit(
            state,
            stage,
            Some(agent),
            EventBody::error(failure.message.clone(), true),
        )
        .await
    }

    async fn intake(&self, state: &mut RunState) -> Result<Transition> {
        self.emit(state, Stage::Intake, None, EventBody::step_started("Validating payment request"))
            .await?;

        state.payment = state.payment.clone().normalized();
        state
            .payment
            .validate()
            .context("Payment failed intake validation")?;

        self.emit(
            state,
            Stage::Intake,
            None,
            EventBody::step_completed(state.payment.describe(), state.payment.to_context()),
        )
        .await?;
        state.mark("intake_completed");
        Ok(Transition::Next(Stage::Sanctions))
    }

    async fn sanctions(&self, state: &mut RunState) -> Result<Transition> {
        let agent = self.agents.sanctions.as_str();
        let beneficiary = state.payment.beneficiary_name.clone();

        self.emit(state, Stage::Sanctions, Some(agent), EventBody::step_started("Screening beneficiary"))
            .await?;

        let request = AgentRequest::new(format!(
            "Screen the following payment beneficiary for sanctions.\n\n\
             Beneficiary Name: {}\n\n\
             Check the OFAC SDN list and return your assessment as JSON.",
            beneficiary
        ))
        .with_context(state.payment.to_context());

        let result = match self.call_stage::<SanctionsResult>(agent, request, "sanctions result").await {
            Ok((mut result, call_id)) => {
                result.tool_run_id = Some(call_id);
                result
            }
            Err(failure) => {
                self.report_failure(state, Stage::Sanctions, agent, &failure).await?;
                SanctionsResult::fallback(failure.call_id, failure.message, failure.parse_error)
            }
        };

        self.emit(
            state,
            Stage::Sanctions,
            Some(agent),
            EventBody::thinking(
                format!("Screening beneficiary '{}' against sanctions lists", beneficiary),
                json!({ "lists_checked": ["OFAC SDN", "EU Sanctions", "UN Sanctions"] }),
            ),
        )
        .await?;

        let details = [
            (DetailCategory::Input, "Beneficiary Name", json!(beneficiary)),
            (DetailCategory::Analysis, "Match Type", json!(result.match_type)),
            (
                DetailCategory::Metric,
                "Confidence Score",
                json!(format!("{}%", result.confidence)),
            ),
        ];
        for (category, label, value) in details {
            self.emit(state, Stage::Sanctions, Some(agent), EventBody::detail(category, label, value))
                .await?;
        }

        let finding = match result.decision {
            SanctionsDecision::Block => {
                let matched = result
                    .match_details
                    .as_ref()
                    .and_then(|d| d.get("matched_entity"))
                    .cloned()
                    .unwrap_or_else(|| json!(beneficiary));
                let programs = result
                    .match_details
                    .as_ref()
                    .and_then(|d| d.get("programs"))
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                EventBody::finding(
                    "sanctions_match",
                    Severity::Critical,
                    format!("BLOCKED: {} match found against SDN list", result.match_type),
                    json!({
                        "matched_entity": matched,
                        "programs": programs,
                        "confidence": result.confidence,
                    }),
                )
            }
            SanctionsDecision::Escalate => EventBody::finding(
                "potential_match",
                Severity::Warning,
                format!(
                    "Potential match requires manual review (confidence: {}%)",
                    result.confidence
                ),
                json!({ "recommendation": result.recommendation }),
            ),
            SanctionsDecision::Clear => EventBody::finding(
                "sanctions_clear",
                Severity::Info,
                "No sanctions matches found - beneficiary cleared",
                json!({ "confidence": result.confidence }),
            ),
        };
        self.emit(state, Stage::Sanctions, Some(agent), finding).await?;

        let outcome = format!("{} ({}%)", result.decision, result.confidence);
        self.emit(
            state,
            Stage::Sanctions,
            Some(agent),
            EventBody::tool_call(
                "screen_sanctions",
                result.tool_run_id.clone(),
                json!({ "beneficiary_name": beneficiary }),
                Some(outcome.clone()),
                None,
            ),
        )
        .await?;

        let mut summary = outcome;
        if result.match_type != "NONE" {
            summary.push_str(&format!(" | Match: {}", result.match_type));
        }
        summary.push_str(&format!(" | {}", truncate(&result.recommendation, 60)));
        state.ledger.append(
            Evidence::new(agent, "sanctions_screening", result.confidence / 100.0, summary.clone())
                .with_data(json!(result)),
        );

        self.emit(
            state,
            Stage::Sanctions,
            Some(agent),
            EventBody::step_completed(
                summary,
                json!({
                    "decision": result.decision,
                    "confidence": result.confidence,
                    "match_type": result.match_type,
                    "recommendation": result.recommendation,
                }),
            ),
        )
        .await?;
        state.mark("sanctions_completed");
        info!(run_id = %state.run_id, decision = %result.decision, "Sanctions screening complete");

        let blocked = result.is_block();
        state.sanctions = Some(result);

        if blocked {
            state.ledger.record(
                Decision::new(
                    DecisionType::Branch,
                    "Sanctions BLOCK requires immediate rejection",
                    1.0,
                    "terminate",
                )
                .with_inputs(&["sanctions_decision"])
                .with_agent(agent),
            );
            self.emit(
                state,
                Stage::Sanctions,
                Some(agent),
                EventBody::branch(
                    "sanctions_decision == BLOCK",
                    "TERMINATE",
                    "Sanctions BLOCK requires immediate rejection",
                ),
            )
            .await?;
            return Ok(Transition::Terminate(SANCTIONS_BLOCK));
        }
        Ok(Transition::Next(Stage::Liquidity))
    }

    async fn liquidity(&self, state: &mut RunState) -> Result<Transition> {
        let agent = self.agents.liquidity.as_str();
        let payment = state.payment.clone();

        self.emit(state, Stage::Liquidity, Some(agent), EventBody::step_started("Assessing liquidity impact"))
            .await?;

        let request = AgentRequest::new(format!(
            "Assess the liquidity impact of paying {}.\n\n\
             Compute whether the payment would breach the intraday buffer threshold \
             and return your assessment as JSON.",
            payment.describe()
        ))
        .with_context(payment.to_context());

        let result = match self.call_stage::<LiquidityResult>(agent, request, "liquidity result").await {
            Ok((mut result, call_id)) => {
                result.tool_run_id = Some(call_id);
                result
            }
            Err(failure) => {
                self.report_failure(state, Stage::Liquidity, agent, &failure).await?;
                LiquidityResult::fallback(failure.call_id, failure.message, failure.parse_error)
            }
        };

        self.emit(
            state,
            Stage::Liquidity,
            Some(agent),
            EventBody::thinking(
                format!(
                    "Analyzing liquidity impact for {} {} payment",
                    payment.currency,
                    format_amount(payment.amount)
                ),
                json!({ "entity": payment.entity, "account": payment.account_id }),
            ),
        )
        .await?;

        let account = &result.account_summary;
        let breach = &result.breach_assessment;
        let details = [
            (DetailCategory::Metric, "Start of Day Balance", account.start_of_day_balance),
            (DetailCategory::Metric, "Total Outflows Today", account.total_outflows),
            (DetailCategory::Metric, "Projected End of Day", account.projected_end_of_day),
            (DetailCategory::Metric, "Buffer Threshold", breach.buffer_threshold),
            (DetailCategory::Comparison, "Projected Minimum Balance", breach.projected_min_balance),
        ];
        for (category, label, amount) in details {
            self.emit(
                state,
                Stage::Liquidity,
                Some(agent),
                EventBody::detail(category, label, json!(dollars(amount))),
            )
            .await?;
        }

        let finding = if result.is_breach() {
            EventBody::finding(
                "liquidity_breach",
                Severity::Critical,
                format!(
                    "Payment would breach buffer threshold by {}",
                    dollars(breach.gap_amount)
                ),
                json!({
                    "gap_amount": breach.gap_amount,
                    "breach_time": breach.first_breach_time.as_deref().unwrap_or("unknown"),
                    "buffer_threshold": breach.buffer_threshold,
                    "projected_balance": breach.projected_min_balance,
                }),
            )
        } else {
            EventBody::finding(
                "liquidity_ok",
                Severity::Info,
                format!("Sufficient headroom: {} above buffer", dollars(breach.headroom)),
                json!({ "headroom": breach.headroom }),
            )
        };
        self.emit(state, Stage::Liquidity, Some(agent), finding).await?;

        let label = if result.is_breach() { "BREACH" } else { "NO_BREACH" };
        self.emit(
            state,
            Stage::Liquidity,
            Some(agent),
            EventBody::tool_call(
                "compute_liquidity_impact",
                result.tool_run_id.clone(),
                json!({ "amount": payment.amount, "currency": payment.currency }),
                Some(label.to_string()),
                None,
            ),
        )
        .await?;

        let mut summary = if result.is_breach() { "BREACH".to_string() } else { "OK".to_string() };
        if result.is_breach() && breach.gap_amount > 0.0 {
            summary.push_str(&format!(" - Gap: {}", dollars(breach.gap_amount)));
        }
        summary.push_str(&format!(" | {}", truncate(&result.recommendation.reason, 80)));
        state.ledger.append(
            Evidence::new(agent, "liquidity_assessment", result_confidence(&result.error), summary.clone())
                .with_data(json!(result)),
        );

        let gap = if result.is_breach() { breach.gap_amount } else { 0.0 };
        let action = if result.recommendation.action.is_empty() {
            "UNKNOWN"
        } else {
            result.recommendation.action.as_str()
        };
        self.emit(
            state,
            Stage::Liquidity,
            Some(agent),
            EventBody::step_completed(
                summary,
                json!({
                    "breach": result.is_breach(),
                    "gap": gap,
                    "buffer_threshold": breach.buffer_threshold,
                    "projected_balance": breach.projected_min_balance,
                    "recommendation": action,
                }),
            ),
        )
        .await?;
        state.mark("liquidity_completed");
        info!(run_id = %state.run_id, breach = result.is_breach(), "Liquidity screening complete");

        state.liquidity = Some(result);
        Ok(Transition::Next(Stage::Procedures))
    }

    async fn procedures(&self, state: &mut RunState) -> Result<Transition> {
        let agent = self.agents.procedures.as_str();

        self.emit(state, Stage::Procedures, Some(agent), EventBody::step_started("Determining operational workflow"))
            .await?;

        let context = json!({
            "payment": state.payment,
            "sanctions": state.sanctions,
            "liquidity": state.liquidity,
        });
        let mut message = String::from(
            "Based on the screening results in the context, query the treasury knowledge base and \
             determine the required approvers, the workflow steps to follow, the documentation \
             needed for audit and the relevant policy citations. Return your assessment as JSON.",
        );
        if let Some(block) = state.ledger.context_block(DEFAULT_EVIDENCE_WINDOW) {
            message.push_str("\n\n");
            message.push_str(&block);
        }
        let request = AgentRequest::new(message).with_context(context);

        let result = match self.call_stage::<ProceduresResult>(agent, request, "procedures result").await {
            Ok((mut result, call_id)) => {
                result.tool_run_id = Some(call_id);
                result
            }
            Err(failure) => {
                self.report_failure(state, Stage::Procedures, agent, &failure).await?;
                ProceduresResult::fallback(failure.call_id, failure.message, failure.parse_error)
            }
        };

        let sanctions_decision = state
            .sanctions
            .as_ref()
            .map(|s| s.decision)
            .unwrap_or_default();
        let breach = state.liquidity.as_ref().map_or(false, LiquidityResult::is_breach);

        self.emit(
            state,
            Stage::Procedures,
            Some(agent),
            EventBody::thinking(
                "Consulting treasury knowledge base for applicable policies and procedures",
                json!({
                    "sanctions_decision": sanctions_decision,
                    "liquidity_breach": breach,
                    "amount": state.payment.amount,
                }),
            ),
        )
        .await?;

        if !result.citations.is_empty() {
            let sources = result.citations.iter().map(|c| c.source.clone()).collect();
            self.emit(
                state,
                Stage::Procedures,
                Some(agent),
                EventBody::kb_query("treasury policies and procedures", sources),
            )
            .await?;

            for citation in result.citations.iter().take(3) {
                let snippet = if citation.snippet.chars().count() > 100 {
                    format!("{}...", truncate(&citation.snippet, 100))
                } else {
                    citation.snippet.clone()
                };
                self.emit(
                    state,
                    Stage::Procedures,
                    Some(agent),
                    EventBody::detail(
                        DetailCategory::Input,
                        format!("Policy: {}", citation.source),
                        json!(snippet),
                    )
                    .with_metadata(json!({ "reference": citation.reference })),
                )
                .await?;
            }
        }

        let determination = &result.workflow_determination;
        self.emit(
            state,
            Stage::Procedures,
            Some(agent),
            EventBody::detail(
                DetailCategory::Result,
                "Determined Action",
                json!(determination.final_action),
            ),
        )
        .await?;
        if !determination.policy_reference.is_empty() {
            self.emit(
                state,
                Stage::Procedures,
                Some(agent),
                EventBody::detail(
                    DetailCategory::Input,
                    "Policy Reference",
                    json!(determination.policy_reference),
                ),
            )
            .await?;
        }

        if !result.approvals_required.is_empty() {
            let roles: Vec<&str> = result
                .approvals_required
                .iter()
                .map(|a| a.role.as_str())
                .collect();
            let severity = if roles.len() > 1 {
                Severity::Warning
            } else {
                Severity::Info
            };
            self.emit(
                state,
                Stage::Procedures,
                Some(agent),
                EventBody::finding(
                    "approvals_required",
                    severity,
                    format!("Required approvals: {}", roles.join(", ")),
                    json!({ "approvers": result.approvals_required }),
                ),
            )
            .await?;
        }

        if !result.procedure_checklist.is_empty() {
            self.emit(
                state,
                Stage::Procedures,
                Some(agent),
                EventBody::finding(
                    "procedure_steps",
                    Severity::Info,
                    format!(
                        "{} operational steps identified",
                        result.procedure_checklist.len()
                    ),
                    json!({ "steps": result.procedure_checklist }),
                ),
            )
            .await?;
        }

        let mut summary = determination.final_action.clone();
        if !determination.reason.is_empty() {
            summary.push_str(&format!(" | {}", truncate(&determination.reason, 80)));
        }
        if !result.approvals_required.is_empty() {
            summary.push_str(&format!(
                " | {} approvals needed",
                result.approvals_required.len()
            ));
        }
        state.ledger.append(
            Evidence::new(agent, "procedures_determination", result_confidence(&result.error), summary.clone())
                .with_data(json!(result)),
        );

        self.emit(
            state,
            Stage::Procedures,
            Some(agent),
            EventBody::step_completed(
                summary,
                json!({
                    "final_action": determination.final_action,
                    "reason": determination.reason,
                    "policy_reference": determination.policy_reference,
                    "approvals_count": result.approvals_required.len(),
                    "steps_count": result.procedure_checklist.len(),
                    "citations_count": result.citations.len(),
                }),
            ),
        )
        .await?;
        state.mark("procedures_completed");
        info!(run_id = %state.run_id, action = %determination.final_action, "Procedures determined");

        state.procedures = Some(result);
        Ok(Transition::Next(Stage::Summarize))
    }

    /// Build the packet, publish it as the final event, then persist it.
    /// The run only becomes completed once the final event is out.
    async fn summarize(&self, mut state: RunState) -> Result<DecisionPacket> {
        self.emit(&state, Stage::Summarize, None, EventBody::step_started("Building decision packet"))
            .await?;
        state.mark("workflow_completed");

        let packet = match state.terminated {
            Some(reason) => block_packet(state, reason),
            None => decision_packet(state),
        };

        let document = serde_json::to_value(&packet).context("Failed to serialize decision packet")?;
        self.bus
            .publish(
                &packet.run_id,
                Stage::Summarize.as_str(),
                None,
                EventBody::final_outcome(packet.decision.as_str(), packet.summary(), document.clone()),
            )
            .await?;

        let saved = self
            .store
            .save_decision(&packet.run_id, packet.decision.as_str(), &document, &packet.timestamps)
            .await?;
        if !saved {
            warn!(run_id = %packet.run_id, "Run already terminal, decision not saved");
        }
        self.bus.end(&packet.run_id).await;

        info!(run_id = %packet.run_id, decision = %packet.decision, "Workflow completed");
        Ok(packet)
    }
}

/// Evidence confidence of a stage result: none for a fallback
fn result_confidence(error: &Option<String>) -> f64 {
    if error.is_some() {
        0.0
    } else {
        1.0
    }
}

/// Packet for a run terminated by a sanctions block
fn block_packet(state: RunState, reason: &str) -> DecisionPacket {
    let sanctions = state
        .sanctions
        .unwrap_or_else(|| SanctionsResult::fallback(None, "Sanctions result missing", false));
    let payment = state.payment;

    let match_details = sanctions
        .match_details
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_else(|| "None".to_string());

    DecisionPacket {
        run_id: state.run_id,
        decision: FinalDecision::Reject,
        rationale: vec![
            format!("Payment BLOCKED due to sanctions match: {}", sanctions.match_type),
            format!("Beneficiary '{}' matched against SDN list", payment.beneficiary_name),
            format!("Confidence: {}%", sanctions.confidence),
            "Immediate rejection required per compliance policy".to_string(),
        ],
        procedure_checklist: vec![
            ChecklistStep::new(
                1,
                "REJECT payment immediately",
                "System (automatic)",
                "Sanctions match details, rejection timestamp",
            ),
            ChecklistStep::new(
                2,
                "Generate compliance case",
                "Compliance Officer",
                "Full sanctions report, evidence package",
            ),
            ChecklistStep::new(
                3,
                "File regulatory report if required",
                "MLRO",
                "SAR/STR as applicable",
            ),
        ],
        approvals_required: vec![ApprovalRequired::new(
            "Compliance Officer",
            "Review and document sanctions match",
            4,
        )],
        sod_constraints: vec!["No self-approval of compliance review".to_string()],
        cutoff_actions: vec!["Immediate rejection - no cutoff applicable".to_string()],
        citations: vec![Citation {
            source: "OFAC SDN List".to_string(),
            snippet: format!("Match found: {}", match_details),
            reference: "idx-ofac-sdn-v1".to_string(),
        }],
        audit_note: json!({
            "workflow_terminated_early": true,
            "termination_reason": reason,
            "sanctions_tool_run_id": sanctions.tool_run_id,
            "evidence": state.ledger.all(),
            "decisions": state.ledger.decisions(),
        }),
        timestamps: state.timestamps,
        payment,
        sanctions,
        liquidity: None,
        procedures: None,
    }
}

/// Packet for a run that went through every stage
fn decision_packet(state: RunState) -> DecisionPacket {
    let sanctions = state
        .sanctions
        .unwrap_or_else(|| SanctionsResult::fallback(None, "Sanctions result missing", false));
    let liquidity = state
        .liquidity
        .unwrap_or_else(|| LiquidityResult::fallback(None, "Liquidity result missing", false));
    let procedures = state
        .procedures
        .unwrap_or_else(|| ProceduresResult::fallback(None, "Procedures result missing", false));
    let payment = state.payment;

    let final_action = procedures.workflow_determination.final_action.clone();
    let decision = FinalDecision::from_action(&final_action);
    let breach = liquidity.is_breach();

    let rationale = vec![
        format!(
            "Sanctions screening: {} ({}% confidence)",
            sanctions.decision, sanctions.confidence
        ),
        format!(
            "Liquidity assessment: {}",
            if breach { "BREACH detected" } else { "No breach" }
        ),
        format!("Final action: {}", final_action),
        procedures.workflow_determination.reason.clone(),
    ];

    let mut sod_constraints = vec![
        "Maker-checker separation required for approvals".to_string(),
        "No self-approval permitted".to_string(),
    ];
    if payment.amount > DUAL_APPROVAL_THRESHOLD {
        sod_constraints.push("Dual approval required for amounts > USD 250,000".to_string());
    }

    let mut cutoff_actions = Vec::new();
    if breach {
        cutoff_actions.push("Payment held pending liquidity resolution".to_string());
    }
    if decision == FinalDecision::Hold {
        cutoff_actions
            .push("Cutoff extension may be requested with Treasury Manager approval".to_string());
    }

    DecisionPacket {
        run_id: state.run_id,
        decision,
        rationale,
        procedure_checklist: procedures.procedure_checklist.clone(),
        approvals_required: procedures.approvals_required.clone(),
        sod_constraints,
        cutoff_actions,
        citations: procedures.citations.clone(),
        audit_note: json!({
            "sanctions_tool_run_id": sanctions.tool_run_id,
            "liquidity_tool_run_id": liquidity.tool_run_id,
            "procedures_tool_run_id": procedures.tool_run_id,
            "policies_consulted": procedures.policies_consulted(),
            "evidence": state.ledger.all(),
            "decisions": state.ledger.decisions(),
        }),
        timestamps: state.timestamps,
        payment,
        sanctions,
        liquidity: Some(liquidity),
        procedures: Some(procedures),
    }
}

fn dollars(amount: f64) -> String {
    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{}${}", sign, format_amount(amount))
}

/// First `max` characters of `s`
fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
