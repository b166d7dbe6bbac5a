//! Run state.
//!
//! A Run represents a single end-to-end execution for one input: either a
//! compliance screening of a payment or a portfolio orchestration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A workflow execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run (UUID v4 text)
    pub id: String,

    /// Which engine drives the run
    pub kind: RunKind,

    /// Current status
    pub status: RunStatus,

    /// Immutable input payload
    pub request: Value,

    /// First 16 hex chars of the SHA-256 of the request payload
    pub request_digest: String,

    /// Decision label once completed (e.g. "HOLD", or the topology outcome)
    pub decision: Option<String>,

    /// Full result document (decision packet or portfolio result)
    pub result: Option<Value>,

    /// Error message if the run failed
    pub error: Option<String>,

    /// Stage name -> completion instant
    #[serde(default)]
    pub timestamps: BTreeMap<String, DateTime<Utc>>,

    /// When the run was submitted
    pub created_at: DateTime<Utc>,

    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a pending run for the given request payload
    pub fn new(kind: RunKind, request: Value) -> Self {
        let request_digest = hash_input(&request.to_string());
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: RunStatus::Pending,
            request,
            request_digest,
            decision: None,
            result: None,
            error: None,
            timestamps: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Beneficiary of a compliance run (for listings)
    pub fn beneficiary(&self) -> Option<&str> {
        self.request.get("beneficiary_name").and_then(Value::as_str)
    }

    /// Amount and currency of a compliance run (for listings)
    pub fn amount(&self) -> Option<(f64, &str)> {
        let amount = self.request.get("amount").and_then(Value::as_f64)?;
        let currency = self
            .request
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("USD");
        Some((amount, currency))
    }
}

/// Engine that owns a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Fixed sanctions/liquidity/procedures pipeline
    Compliance,
    /// Generalized multi-topology orchestrator
    Orchestration,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliance => "compliance",
            Self::Orchestration => "orchestration",
        }
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compliance" => Ok(Self::Compliance),
            "orchestration" => Ok(Self::Orchestration),
            other => Err(format!("unknown run kind: {}", other)),
        }
    }
}

/// Lifecycle of a run. `Completed` and `Failed` are terminal and written once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Paging and filtering for run listings (newest first)
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub limit: usize,
    pub offset: usize,
    pub status: Option<RunStatus>,
    pub kind: Option<RunKind>,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            status: None,
            kind: None,
        }
    }
}

impl RunFilter {
    pub fn matches(&self, run: &Run) -> bool {
        self.status.map_or(true, |s| run.status == s) && self.kind.map_or(true, |k| run.kind == k)
    }
}

/// Outcome of asking for a run's result
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// Terminal and successful; carries the result document
    Ready(Value),
    /// Still pending or running
    Pending(RunStatus),
    /// Terminal failure with its error message
    Failed(String),
    NotFound,
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_run_is_pending() {
        let run = Run::new(RunKind::Compliance, json!({ "beneficiary_name": "ACME" }));
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.is_terminal());
        assert_eq!(run.request_digest.len(), 16);
        assert_eq!(run.beneficiary(), Some("ACME"));
        assert!(Uuid::parse_str(&run.id).is_ok());
    }

    #[test]
    fn test_digest_is_stable_for_same_payload() {
        let a = Run::new(RunKind::Compliance, json!({ "amount": 10 }));
        let b = Run::new(RunKind::Compliance, json!({ "amount": 10 }));
        let c = Run::new(RunKind::Compliance, json!({ "amount": 11 }));

        assert_ne!(a.id, b.id);
        assert_eq!(a.request_digest, b.request_digest);
        assert_ne!(a.request_digest, c.request_digest);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("COMPLETED".parse::<RunStatus>(), Ok(RunStatus::Completed));
        assert!("paused".parse::<RunStatus>().is_err());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_filter_matching() {
        let run = Run::new(RunKind::Orchestration, json!({}));
        let filter = RunFilter {
            status: Some(RunStatus::Pending),
            ..Default::default()
        };
        assert!(filter.matches(&run));

        let filter = RunFilter {
            kind: Some(RunKind::Compliance),
            ..Default::default()
        };
        assert!(!filter.matches(&run));
    }
}
