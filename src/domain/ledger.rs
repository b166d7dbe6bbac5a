//! Evidence and decision records kept for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::short_id;

/// An observation produced by an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// `ev-<hex8>`
    pub id: String,

    /// Agent that produced the evidence
    pub agent: String,

    /// Evidence type, e.g. "risk_analysis" or "sanctions_screening"
    #[serde(rename = "type")]
    pub kind: String,

    /// 0.0 - 1.0
    pub confidence: f64,

    /// One-line human summary
    pub summary: String,

    /// Structured output the summary was derived from
    #[serde(default)]
    pub data: Value,

    pub timestamp: DateTime<Utc>,
}

impl Evidence {
    pub fn new(
        agent: impl Into<String>,
        kind: impl Into<String>,
        confidence: f64,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("ev-{}", short_id()),
            agent: agent.into(),
            kind: kind.into(),
            confidence: confidence.clamp(0.0, 1.0),
            summary: summary.into(),
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Line used when feeding evidence to later agents
    pub fn context_line(&self) -> String {
        format!(
            "- [{}] {} (from {}, confidence: {})",
            self.kind, self.summary, self.agent, self.confidence
        )
    }
}

/// A reasoning step taken by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// `dec-<hex8>`
    pub id: String,

    pub timestamp: DateTime<Utc>,

    #[serde(rename = "type")]
    pub kind: DecisionType,

    pub reasoning: String,

    /// 0.0 - 1.0
    pub confidence: f64,

    /// Names of the inputs weighed
    #[serde(default)]
    pub inputs_considered: Vec<String>,

    /// Action taken as a result
    pub action: String,

    /// Agent concerned (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Decision {
    pub fn new(
        kind: DecisionType,
        reasoning: impl Into<String>,
        confidence: f64,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("dec-{}", short_id()),
            timestamp: Utc::now(),
            kind,
            reasoning: reasoning.into(),
            confidence: confidence.clamp(0.0, 1.0),
            inputs_considered: Vec::new(),
            action: action.into(),
            agent: None,
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs_considered = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// Kinds of orchestrator decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    WorkflowSelection,
    WorkflowStarted,
    ExecutorInvoked,
    AgentCompleted,
    /// Coordinator delegated to a specialist
    Handoff,
    /// Manager revised its plan
    Replan,
    /// A run left its normal path, e.g. terminated early
    Branch,
    /// A stage substituted a conservative result for a failed agent call
    Fallback,
    Commit,
    Failure,
}
