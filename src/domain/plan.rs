//! Plans, tasks and results of the generalized orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::short_id;

/// Task-dependency shape used to drive a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    /// Fixed chain, one task after another
    Sequential,
    /// Independent specialists fan out, an aggregator fans in
    Concurrent,
    /// A coordinator delegates to one specialist per turn
    Handoff,
    /// A manager plans, observes and re-plans
    Magentic,
    /// Explicit dependency graph
    Dag,
    /// Round-robin discussion until consensus
    GroupChat,
}

impl TopologyKind {
    pub const ALL: [TopologyKind; 6] = [
        Self::Sequential,
        Self::Concurrent,
        Self::Handoff,
        Self::Magentic,
        Self::Dag,
        Self::GroupChat,
    ];

    /// Parse a topology name; `None` for unknown names
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" => Some(Self::Sequential),
            "concurrent" => Some(Self::Concurrent),
            "handoff" => Some(Self::Handoff),
            "magentic" => Some(Self::Magentic),
            "dag" => Some(Self::Dag),
            "group_chat" | "groupchat" => Some(Self::GroupChat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
            Self::Handoff => "handoff",
            Self::Magentic => "magentic",
            Self::Dag => "dag",
            Self::GroupChat => "group_chat",
        }
    }
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Investor risk appetite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Conservative,
    Moderate,
    Aggressive,
    VeryAggressive,
}

impl Default for RiskTier {
    fn default() -> Self {
        Self::Moderate
    }
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::VeryAggressive => "very_aggressive",
        }
    }
}

/// Investment mandate driving an orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mandate {
    /// Investment policy statement identifier
    #[serde(default = "default_policy_id")]
    pub policy_id: String,

    #[serde(default)]
    pub risk_tier: RiskTier,

    /// Environmental/social/governance emphasis (widens the re-planning budget)
    #[serde(default)]
    pub esg_focus: bool,

    #[serde(default = "default_portfolio_value")]
    pub portfolio_value: f64,

    /// Free-text constraints passed through to every agent
    #[serde(default)]
    pub constraints: Vec<String>,
}

fn default_policy_id() -> String {
    "ips-default".to_string()
}

fn default_portfolio_value() -> f64 {
    1_000_000.0
}

impl Default for Mandate {
    fn default() -> Self {
        Self {
            policy_id: default_policy_id(),
            risk_tier: RiskTier::default(),
            esg_focus: false,
            portfolio_value: default_portfolio_value(),
            constraints: Vec::new(),
        }
    }
}

/// What a task asks its agent to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    AnalyzePolicy,
    FetchMarketData,
    ComputeRisk,
    ComputeReturns,
    OptimizePortfolio,
    CheckCompliance,
    ResolveConflict,
    CommitPortfolio,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyzePolicy => "analyze_policy",
            Self::FetchMarketData => "fetch_market_data",
            Self::ComputeRisk => "compute_risk",
            Self::ComputeReturns => "compute_returns",
            Self::OptimizePortfolio => "optimize_portfolio",
            Self::CheckCompliance => "check_compliance",
            Self::ResolveConflict => "resolve_conflict",
            Self::CommitPortfolio => "commit_portfolio",
        }
    }

    /// Evidence type recorded for a completed task of this kind
    pub fn evidence_type(&self) -> &'static str {
        match self {
            Self::AnalyzePolicy => "policy_analysis",
            Self::FetchMarketData => "market_data",
            Self::ComputeRisk => "risk_analysis",
            Self::ComputeReturns => "return_analysis",
            Self::OptimizePortfolio => "optimization",
            Self::CheckCompliance => "compliance_check",
            Self::ResolveConflict => "conflict_resolution",
            Self::CommitPortfolio => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    /// Waiting on dependencies that cannot complete
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// A unit of work assigned to one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// `task-<hex8>`
    pub id: String,
    pub kind: TaskKind,
    pub agent: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Ids of tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 1 (lowest) - 10 (highest)
    pub priority: u8,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(kind: TaskKind, agent: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", short_id()),
            kind,
            agent: agent.into(),
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            priority: 5,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn after(mut self, deps: &[&Task]) -> Self {
        self.depends_on = deps.iter().map(|t| t.id.clone()).collect();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Running,
    Completed,
    Failed,
}

/// Where final allocations came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    /// Extracted from the last agent output
    Agent,
    /// Risk-tier default used because no agent output carried allocations
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioMetrics {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

/// Final allocation produced by an orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioResult {
    /// Ticker -> weight (weights sum to ~1.0)
    pub allocations: BTreeMap<String, f64>,
    pub metrics: PortfolioMetrics,
    pub source: AllocationSource,
}

impl PortfolioResult {
    /// Allocation used when no agent output carries one
    pub fn default_for(tier: RiskTier) -> Self {
        let (weights, metrics): (&[(&str, f64)], _) = match tier {
            RiskTier::Conservative => (
                &[
                    ("VTI", 0.25),
                    ("VXUS", 0.10),
                    ("BND", 0.40),
                    ("BNDX", 0.15),
                    ("VNQ", 0.05),
                    ("CASH", 0.05),
                ],
                (5.5, 8.0, 0.44),
            ),
            RiskTier::Aggressive => (
                &[
                    ("VTI", 0.45),
                    ("VXUS", 0.20),
                    ("QQQ", 0.15),
                    ("BND", 0.10),
                    ("VNQ", 0.07),
                    ("CASH", 0.03),
                ],
                (9.5, 16.0, 0.47),
            ),
            // very_aggressive has no table of its own and uses moderate
            RiskTier::Moderate | RiskTier::VeryAggressive => (
                &[
                    ("VTI", 0.35),
                    ("VXUS", 0.15),
                    ("BND", 0.30),
                    ("BNDX", 0.10),
                    ("VNQ", 0.05),
                    ("CASH", 0.05),
                ],
                (7.2, 11.5, 0.45),
            ),
        };

        Self {
            allocations: weights
                .iter()
                .map(|(ticker, w)| (ticker.to_string(), *w))
                .collect(),
            metrics: PortfolioMetrics {
                expected_return: metrics.0,
                volatility: metrics.1,
                sharpe_ratio: metrics.2,
            },
            source: AllocationSource::Default,
        }
    }

    /// Read `allocations` (and optional `metrics`) from an agent output
    pub fn from_output(output: &Value) -> Option<Self> {
        let allocations: BTreeMap<String, f64> = output
            .get("allocations")?
            .as_object()?
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|w| (k.clone(), w)))
            .collect();
        if allocations.is_empty() {
            return None;
        }
        let metrics = output
            .get("metrics")
            .and_then(|m| serde_json::from_value(m.clone()).ok())
            .unwrap_or_default();
        Some(Self {
            allocations,
            metrics,
            source: AllocationSource::Agent,
        })
    }

    pub fn total_weight(&self) -> f64 {
        self.allocations.values().sum()
    }
}

/// Orchestrator plan for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// `plan-<hex8>`
    pub id: String,
    pub run_id: String,
    pub topology: TopologyKind,
    pub mandate: Mandate,
    pub tasks: Vec<Task>,
    pub status: PlanStatus,
    pub result: Option<PortfolioResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Plan {
    pub fn new(run_id: impl Into<String>, topology: TopologyKind, mandate: Mandate) -> Self {
        Self {
            id: format!("plan-{}", short_id()),
            run_id: run_id.into(),
            topology,
            mandate,
            tasks: Vec::new(),
            status: PlanStatus::Planning,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Agents whose tasks completed, in completion order
    pub fn completed_agents(&self) -> Vec<String> {
        let mut done: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .collect();
        done.sort_by_key(|t| t.completed_at);
        done.into_iter().map(|t| t.agent.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topology_names() {
        for kind in TopologyKind::ALL {
            assert_eq!(TopologyKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(TopologyKind::from_name("Group-Chat"), Some(TopologyKind::GroupChat));
        assert_eq!(TopologyKind::from_name("swarm"), None);
    }

    #[test]
    fn test_task_defaults() {
        let task = Task::new(TaskKind::ComputeRisk, "risk_analyst");
        assert!(task.id.starts_with("task-"));
        assert_eq!(task.priority, 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.with_priority(42).priority, 10);
    }

    #[test]
    fn test_default_allocations_sum_to_one() {
        for tier in [
            RiskTier::Conservative,
            RiskTier::Moderate,
            RiskTier::Aggressive,
            RiskTier::VeryAggressive,
        ] {
            let result = PortfolioResult::default_for(tier);
            assert!((result.total_weight() - 1.0).abs() < 1e-9);
            assert_eq!(result.source, AllocationSource::Default);
        }
    }

    #[test]
    fn test_very_aggressive_uses_moderate_table() {
        assert_eq!(
            PortfolioResult::default_for(RiskTier::VeryAggressive).allocations,
            PortfolioResult::default_for(RiskTier::Moderate).allocations
        );
        assert_eq!(
            PortfolioResult::default_for(RiskTier::Aggressive).metrics.expected_return,
            9.5
        );
    }

    #[test]
    fn test_allocations_from_output() {
        let output = json!({
            "allocations": { "VTI": 0.6, "BND": 0.4 },
            "metrics": { "expected_return": 6.1, "volatility": 9.0, "sharpe_ratio": 0.5 }
        });
        let result = PortfolioResult::from_output(&output).unwrap();
        assert_eq!(result.source, AllocationSource::Agent);
        assert_eq!(result.allocations["VTI"], 0.6);
        assert_eq!(result.metrics.volatility, 9.0);

        assert!(PortfolioResult::from_output(&json!({ "allocations": {} })).is_none());
        assert!(PortfolioResult::from_output(&json!({ "notes": "x" })).is_none());
    }
}
