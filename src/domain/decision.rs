//! Stage results and the final decision packet.
//!
//! Stage results are decoded from agent replies. Fields the agents may omit
//! carry serde defaults; the field that defines each stage's outcome
//! (`decision`, `breach_assessment`, `workflow_determination`) is required so
//! that an unusable reply is a decode failure rather than a silent pass.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::payment::PaymentRequest;

/// Outcome of sanctions screening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SanctionsDecision {
    /// Hard block: the run terminates early with REJECT
    Block,
    /// Needs manual compliance review
    Escalate,
    Clear,
}

impl Default for SanctionsDecision {
    fn default() -> Self {
        Self::Escalate
    }
}

impl SanctionsDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "BLOCK",
            Self::Escalate => "ESCALATE",
            Self::Clear => "CLEAR",
        }
    }
}

impl fmt::Display for SanctionsDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the sanctions stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionsResult {
    #[serde(default = "default_sanctions_agent")]
    pub agent: String,

    pub decision: SanctionsDecision,

    /// 0-100
    #[serde(default)]
    pub confidence: f64,

    /// EXACT, FUZZY, NONE, or ERROR / PARSE_ERROR for fallbacks
    #[serde(default = "default_match_type")]
    pub match_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_details: Option<Value>,

    #[serde(default)]
    pub recommendation: String,

    /// Whether the pipeline may continue to liquidity screening
    #[serde(default)]
    pub pass_to_next_agent: bool,

    /// Invoker call id that produced this result
    #[serde(default)]
    pub tool_run_id: Option<String>,

    #[serde(default)]
    pub audit: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_sanctions_agent() -> String {
    "sanctions_agent".to_string()
}

fn default_match_type() -> String {
    "NONE".to_string()
}

impl SanctionsResult {
    /// Conservative result used when the agent could not be reached or its
    /// reply could not be decoded. Never passes.
    pub fn fallback(call_id: Option<String>, error: impl Into<String>, parse_error: bool) -> Self {
        let (match_type, recommendation) = if parse_error {
            ("PARSE_ERROR", "Parse error - manual review required")
        } else {
            ("ERROR", "System error - manual review required")
        };
        Self {
            agent: default_sanctions_agent(),
            decision: SanctionsDecision::Escalate,
            confidence: 0.0,
            match_type: match_type.to_string(),
            match_details: None,
            recommendation: recommendation.to_string(),
            pass_to_next_agent: false,
            tool_run_id: call_id,
            audit: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn is_block(&self) -> bool {
        self.decision == SanctionsDecision::Block
    }
}

/// Liquidity breach analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachAssessment {
    pub breach: bool,

    #[serde(default)]
    pub first_breach_time: Option<String>,

    /// Shortfall below the buffer (0 when no breach)
    #[serde(default)]
    pub gap_amount: f64,

    #[serde(default)]
    pub projected_min_balance: f64,

    #[serde(default)]
    pub buffer_threshold: f64,

    /// Projected minimum minus buffer (negative on breach)
    #[serde(default)]
    pub headroom: f64,
}

/// Intraday account position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSummary {
    pub start_of_day_balance: f64,
    pub total_outflows: f64,
    pub total_inflows: f64,
    pub net_flow: f64,
    pub projected_end_of_day: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityRecommendation {
    /// RELEASE, HOLD, or ESCALATE
    pub action: String,
    pub reason: String,
    pub alternatives: Vec<String>,
}

/// Result of the liquidity stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityResult {
    #[serde(default = "default_liquidity_agent")]
    pub agent: String,

    pub breach_assessment: BreachAssessment,

    #[serde(default)]
    pub account_summary: AccountSummary,

    #[serde(default)]
    pub recommendation: LiquidityRecommendation,

    #[serde(default)]
    pub tool_run_id: Option<String>,

    #[serde(default)]
    pub audit: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_liquidity_agent() -> String {
    "liquidity_agent".to_string()
}

impl LiquidityResult {
    /// Degraded result: assume a breach so nothing is released unchecked
    pub fn fallback(call_id: Option<String>, error: impl Into<String>, parse_error: bool) -> Self {
        let recommendation = if parse_error {
            LiquidityRecommendation {
                action: "HOLD".to_string(),
                reason: "Parse error".to_string(),
                alternatives: Vec::new(),
            }
        } else {
            LiquidityRecommendation {
                action: "ESCALATE".to_string(),
                reason: "System degradation - liquidity check unavailable".to_string(),
                alternatives: vec!["Manual liquidity verification required".to_string()],
            }
        };
        Self {
            agent: default_liquidity_agent(),
            breach_assessment: BreachAssessment {
                breach: true,
                first_breach_time: None,
                gap_amount: 0.0,
                projected_min_balance: 0.0,
                buffer_threshold: 0.0,
                headroom: 0.0,
            },
            account_summary: AccountSummary::default(),
            recommendation,
            tool_run_id: call_id,
            audit: serde_json::json!({ "degraded_mode": true }),
            error: Some(error.into()),
        }
    }

    pub fn is_breach(&self) -> bool {
        self.breach_assessment.breach
    }
}

/// Final action chosen by the procedures agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDetermination {
    /// PROCEED, RELEASE, HOLD, PARTIAL, ESCALATE or REJECT
    #[serde(default = "default_final_action")]
    pub final_action: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub policy_reference: String,
}

fn default_final_action() -> String {
    "HOLD".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequired {
    pub role: String,
    pub authority: String,
    pub sla_hours: u32,
}

impl ApprovalRequired {
    pub fn new(role: &str, authority: &str, sla_hours: u32) -> Self {
        Self {
            role: role.to_string(),
            authority: authority.to_string(),
            sla_hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistStep {
    pub step: u32,
    pub action: String,
    pub responsible: String,
    pub documentation: String,
}

impl ChecklistStep {
    pub fn new(step: u32, action: &str, responsible: &str, documentation: &str) -> Self {
        Self {
            step,
            action: action.to_string(),
            responsible: responsible.to_string(),
            documentation: documentation.to_string(),
        }
    }
}

/// A policy passage backing a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub snippet: String,
    #[serde(default)]
    pub reference: String,
}

/// Result of the procedures stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProceduresResult {
    #[serde(default = "default_procedures_agent")]
    pub agent: String,

    pub workflow_determination: WorkflowDetermination,

    #[serde(default)]
    pub approvals_required: Vec<ApprovalRequired>,

    #[serde(default)]
    pub procedure_checklist: Vec<ChecklistStep>,

    #[serde(default)]
    pub audit_bundle: Value,

    #[serde(default)]
    pub escalation_contacts: Vec<Value>,

    #[serde(default)]
    pub citations: Vec<Citation>,

    #[serde(default)]
    pub tool_run_id: Option<String>,

    #[serde(default)]
    pub audit: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_procedures_agent() -> String {
    "procedures_agent".to_string()
}

impl ProceduresResult {
    /// Degraded result: hold for full manual review
    pub fn fallback(call_id: Option<String>, error: impl Into<String>, parse_error: bool) -> Self {
        let (reason, policy_reference) = if parse_error {
            ("Parse error", "")
        } else {
            (
                "System degradation - manual review required",
                "emergency_fallback",
            )
        };
        Self {
            agent: default_procedures_agent(),
            workflow_determination: WorkflowDetermination {
                final_action: "HOLD".to_string(),
                reason: reason.to_string(),
                policy_reference: policy_reference.to_string(),
            },
            approvals_required: vec![ApprovalRequired::new(
                "Compliance Officer",
                "Full manual review required",
                4,
            )],
            procedure_checklist: vec![ChecklistStep::new(
                1,
                "HOLD for manual review",
                "System",
                "Error details",
            )],
            audit_bundle: Value::Null,
            escalation_contacts: Vec::new(),
            citations: Vec::new(),
            tool_run_id: call_id,
            audit: serde_json::json!({ "degraded_mode": true }),
            error: Some(error.into()),
        }
    }

    /// Policies listed in the agent's audit section
    pub fn policies_consulted(&self) -> Vec<String> {
        self.audit
            .get("policies_consulted")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Terminal outcome of a compliance run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDecision {
    Release,
    Hold,
    Partial,
    Escalate,
    Reject,
}

impl FinalDecision {
    /// Map a procedures action onto a decision; unknown actions hold
    pub fn from_action(action: &str) -> Self {
        match action.trim().to_uppercase().as_str() {
            "RELEASE" | "PROCEED" => Self::Release,
            "HOLD" => Self::Hold,
            "PARTIAL" => Self::Partial,
            "ESCALATE" => Self::Escalate,
            "REJECT" => Self::Reject,
            _ => Self::Hold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "RELEASE",
            Self::Hold => "HOLD",
            Self::Partial => "PARTIAL",
            Self::Escalate => "ESCALATE",
            Self::Reject => "REJECT",
        }
    }
}

impl fmt::Display for FinalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auditable output of a compliance run, produced once by the summarize stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPacket {
    pub run_id: String,
    pub payment: PaymentRequest,
    pub decision: FinalDecision,
    pub rationale: Vec<String>,
    pub procedure_checklist: Vec<ChecklistStep>,
    pub approvals_required: Vec<ApprovalRequired>,
    pub sod_constraints: Vec<String>,
    pub cutoff_actions: Vec<String>,
    pub citations: Vec<Citation>,
    /// Call ids of every agent invocation plus termination details
    pub audit_note: Value,
    /// Stage name -> completion instant
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
    pub sanctions: SanctionsResult,
    pub liquidity: Option<LiquidityResult>,
    pub procedures: Option<ProceduresResult>,
}

impl DecisionPacket {
    /// First rationale line, used as the run summary
    pub fn summary(&self) -> String {
        self.rationale.first().cloned().unwrap_or_default()
    }
}
