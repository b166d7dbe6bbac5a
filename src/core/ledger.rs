//! Append-only evidence and decision ledger for one run.
//!
//! Owned by the single flow driving the run, so it needs no locking. Records
//! are never removed; later agents see a bounded window of recent evidence.

use crate::domain::{Decision, DecisionType, Evidence};

/// Evidence window handed to later agents when none is configured
pub const DEFAULT_EVIDENCE_WINDOW: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    evidence: Vec<Evidence>,
    decisions: Vec<Decision>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an evidence record
    pub fn append(&mut self, evidence: Evidence) -> &Evidence {
        self.evidence.push(evidence);
        &self.evidence[self.evidence.len() - 1]
    }

    /// Append an orchestrator decision
    pub fn record(&mut self, decision: Decision) -> &Decision {
        self.decisions.push(decision);
        &self.decisions[self.decisions.len() - 1]
    }

    pub fn all(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn by_agent(&self, agent: &str) -> Vec<&Evidence> {
        self.evidence.iter().filter(|e| e.agent == agent).collect()
    }

    pub fn by_type(&self, kind: &str) -> Vec<&Evidence> {
        self.evidence.iter().filter(|e| e.kind == kind).collect()
    }

    /// The last `k` evidence records, oldest first
    pub fn recent(&self, k: usize) -> &[Evidence] {
        let start = self.evidence.len().saturating_sub(k);
        &self.evidence[start..]
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn decisions_of(&self, kind: DecisionType) -> Vec<&Decision> {
        self.decisions.iter().filter(|d| d.kind == kind).collect()
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.len()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }

    /// Prompt section summarizing the last `k` records, or `None` when empty
    pub fn context_block(&self, k: usize) -> Option<String> {
        let recent = self.recent(k);
        if recent.is_empty() {
            return None;
        }

        let lines: Vec<String> = recent.iter().map(Evidence::context_line).collect();
        Some(format!(
            "## Previous Analysis Evidence\n\
             The following evidence has been collected from previous agents in this workflow:\n\n\
             {}\n\n\
             Consider this evidence when making your analysis and recommendations.",
            lines.join("\n")
        ))
    }
}
