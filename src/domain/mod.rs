//! Domain types for the runbook orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Ordered, immutable records streamed to subscribers
//! - Run: Execution state of one workflow instance
//! - Payment: Input of the compliance pipeline
//! - Decision: Stage results and the final decision packet
//! - Plan: Tasks, mandates and results of the generalized orchestrator
//! - Ledger: Evidence and decision records for audit

pub mod decision;
pub mod events;
pub mod ledger;
pub mod payment;
pub mod plan;
pub mod run;

// Re-export commonly used types
pub use decision::{
    AccountSummary, ApprovalRequired, BreachAssessment, ChecklistStep, Citation, DecisionPacket,
    FinalDecision, LiquidityRecommendation, LiquidityResult, ProceduresResult, SanctionsDecision,
    SanctionsResult, WorkflowDetermination,
};
pub use events::{DetailCategory, Event, EventBody, EventKind, Frame, Severity};
pub use ledger::{Decision, DecisionType, Evidence};
pub use payment::{PaymentRequest, ValidationError};
pub use plan::{
    AllocationSource, Mandate, Plan, PlanStatus, PortfolioMetrics, PortfolioResult, RiskTier,
    Task, TaskKind, TaskStatus, TopologyKind,
};
pub use run::{Run, RunFilter, RunKind, RunResult, RunStatus};

/// Short random identifier used as a suffix for task, decision and call ids
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
